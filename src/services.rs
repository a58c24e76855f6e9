//! Core services handed out by the [`ServiceContainer`].

use std::sync::Arc;

use crate::config::SettingsProvider;
use crate::container::ServiceContainer;
use crate::storage::Database;

/// Register the services every host needs.
///
/// - [`Database`], built from the resolved database settings
pub fn register_core_services(container: &ServiceContainer) {
    container.register::<Database, _>(|ctx| {
        let settings = ctx.settings()?;
        Ok(Arc::new(Database::from_settings(&settings.database_settings())?))
    });
}

/// Container over `provider` with the core services registered.
pub fn core_container(provider: Arc<SettingsProvider>) -> ServiceContainer {
    let container = ServiceContainer::new(provider);
    register_core_services(&container);
    container
}
