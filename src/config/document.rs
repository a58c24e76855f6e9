//! Persisted config.kdl document and its edit transactions.
//!
//! The store keeps two views of the same file: the parsed [`KdlDocument`],
//! which retains every comment and formatting detail, and the typed
//! [`ConfigDocument`] derived from it. Edits go through an
//! [`EditTransaction`]:
//!
//! ```ignore
//! let mut tx = store.edit()?;
//! tx.user.theme = Theme::Dark;
//! tx.commit()?; // diff against the snapshot, write only changed leaves
//! ```
//!
//! Dropping a transaction without calling `commit()` discards the working
//! copy. Only the outermost scope writes. Nested scopes come from
//! [`EditTransaction::edit`], which shares the caller's working copy, or
//! from calling [`DocumentStore::edit`] again on the thread that holds the
//! transaction, which merges its changes into the transaction on commit.

use std::io::{ErrorKind, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use kdl::{KdlDocument, KdlDocumentFormat, KdlEntry, KdlEntryFormat, KdlNode, KdlNodeFormat};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::schema::{ConfigDocument, DEFAULT_DOCUMENT, FieldChange, FieldValue};
use crate::{Error, Result};

const INDENT: &str = "    ";

/// How the document was obtained when the store was opened or reloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Parsed an existing file.
    Loaded,
    /// No file existed; defaults were written.
    Created,
    /// The file could not be parsed. It was moved aside and defaults were written.
    Recovered {
        /// Why the original could not be used.
        reason: String,
        /// Where the original content was preserved.
        backup: PathBuf,
    },
}

/// The transaction currently open on a store.
struct OpenEdit {
    /// Thread that opened the outermost scope
    owner: ThreadId,
    /// Canonical document when the outermost scope opened
    snapshot: ConfigDocument,
    /// Changes merged by re-entrant scopes that already committed
    working: ConfigDocument,
}

struct StoreState {
    /// Parsed file, including comments and unknown nodes
    kdl: KdlDocument,
    /// Typed view of `kdl`
    document: ConfigDocument,
    open: Option<OpenEdit>,
    /// Identifies the open transaction; bumped per outermost scope
    txn: u64,
    /// Open edit scopes; zero when idle
    depth: usize,
    /// Set when a nested scope exits without committing
    aborted: bool,
    /// Number of committed writes
    revision: u64,
    last_load: LoadOutcome,
}

/// Owner of config.kdl.
///
/// Concurrent readers are fine. One thread at a time may hold an edit
/// transaction; [`edit`](Self::edit) from any other thread fails with
/// [`Error::EditInProgress`] until it closes. The owning thread may call
/// `edit` again and joins the open transaction.
pub struct DocumentStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore").field("path", &self.path).finish()
    }
}

impl DocumentStore {
    /// Open the document at `path`, creating it with defaults if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (kdl, outcome) = load_or_create(&path)?;
        let document = ConfigDocument::from_kdl(&kdl);

        Ok(Self {
            path,
            state: Mutex::new(StoreState {
                kdl,
                document,
                open: None,
                txn: 0,
                depth: 0,
                aborted: false,
                revision: 0,
                last_load: outcome,
            }),
        })
    }

    /// Path of the document on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the canonical document.
    pub fn read(&self) -> ConfigDocument {
        self.lock().document.clone()
    }

    /// Canonical document text as it would be written to disk.
    pub fn text(&self) -> String {
        self.lock().kdl.to_string()
    }

    /// Outcome of the most recent load.
    pub fn last_load(&self) -> LoadOutcome {
        self.lock().last_load.clone()
    }

    /// Number of writes performed by committed transactions.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Currently open edit scopes.
    pub fn depth(&self) -> usize {
        self.lock().depth
    }

    /// Re-read the file from disk, replacing the canonical document.
    pub fn reload(&self) -> Result<LoadOutcome> {
        let mut state = self.lock();
        if state.open.is_some() {
            return Err(Error::EditInProgress(self.path.display().to_string()));
        }

        let (kdl, outcome) = load_or_create(&self.path)?;
        state.document = ConfigDocument::from_kdl(&kdl);
        state.kdl = kdl;
        state.last_load = outcome.clone();
        Ok(outcome)
    }

    /// Open an edit scope.
    ///
    /// With no transaction open this starts one over a clone of the
    /// canonical document. On the thread that already holds the
    /// transaction it opens a nested scope starting from the changes merged
    /// so far; nothing is written until the outermost scope commits.
    pub fn edit(&self) -> Result<EditTransaction<'_>> {
        let mut state = self.lock();
        let me = thread::current().id();

        let scope = match state.open.as_ref().map(|open| (open.owner, open.working.clone())) {
            Some((owner, working)) if owner == me => Scope::Store {
                base: working.clone(),
                working,
                outermost: false,
            },
            Some(_) => return Err(Error::EditInProgress(self.path.display().to_string())),
            None => {
                let snapshot = state.document.clone();
                state.open = Some(OpenEdit {
                    owner: me,
                    snapshot: snapshot.clone(),
                    working: snapshot.clone(),
                });
                state.txn += 1;
                state.aborted = false;
                debug!(event = "config.edit.started", path = %self.path.display());
                Scope::Store {
                    base: snapshot.clone(),
                    working: snapshot,
                    outermost: true,
                }
            }
        };
        state.depth += 1;

        Ok(EditTransaction {
            store: self,
            txn: state.txn,
            scope,
            finished: false,
        })
    }

    /// Run `f` inside an edit scope.
    ///
    /// Commits when `f` returns `Ok`; discards the working copy and returns
    /// the error otherwise.
    pub fn update<R>(&self, f: impl FnOnce(&mut ConfigDocument) -> Result<R>) -> Result<R> {
        let mut tx = self.edit()?;
        let result = f(&mut *tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter_nested(&self, txn: u64) {
        let mut state = self.lock();
        if state.txn == txn && state.open.is_some() {
            state.depth += 1;
        }
    }

    /// Close a nested scope. Closing without committing aborts the whole
    /// transaction.
    fn leave(&self, txn: u64, committed: bool) {
        let mut state = self.lock();
        if state.txn != txn || state.open.is_none() {
            return;
        }
        state.depth = state.depth.saturating_sub(1);
        if !committed {
            state.aborted = true;
        }
    }

    /// Fold a committed re-entrant scope into the open transaction.
    fn merge_nested(
        &self,
        txn: u64,
        base: &ConfigDocument,
        working: &ConfigDocument,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.txn != txn {
            return Err(Error::EditAborted);
        }
        state.depth = state.depth.saturating_sub(1);

        let merged = match state.open.as_mut() {
            Some(open) => merge(&mut open.working, working, base),
            None => return Err(Error::EditAborted),
        };
        if merged.is_err() {
            state.aborted = true;
        }
        merged
    }

    /// Drop the open transaction without writing.
    fn discard(&self, txn: u64) {
        let mut state = self.lock();
        if state.txn == txn {
            state.open = None;
            state.depth = 0;
            state.aborted = false;
        }
    }

    /// Apply the outermost transaction's changes and persist them.
    fn finish_outer(
        &self,
        txn: u64,
        base: &ConfigDocument,
        working: &ConfigDocument,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.txn != txn {
            return Err(Error::EditAborted);
        }
        let open = state.open.take();
        state.depth = 0;

        if std::mem::take(&mut state.aborted) {
            warn!(
                event = "config.edit.aborted",
                path = %self.path.display(),
                "Discarding edit transaction after a nested scope failed"
            );
            return Err(Error::EditAborted);
        }
        let Some(open) = open else {
            return Err(Error::EditAborted);
        };

        let mut merged = open.working;
        merge(&mut merged, working, base)?;

        let changes = merged.diff(&open.snapshot);
        if changes.is_empty() {
            debug!(event = "config.edit.unchanged", path = %self.path.display());
            return Ok(());
        }

        let mut kdl = state.kdl.clone();
        for change in &changes {
            apply_change(&mut kdl, change);
        }

        // Persist before swapping so a failed write leaves memory untouched.
        write_atomic(&self.path, &kdl.to_string())?;

        state.document = ConfigDocument::from_kdl(&kdl);
        state.kdl = kdl;
        state.revision += 1;
        info!(
            event = "config.edit.committed",
            path = %self.path.display(),
            changed = changes.len(),
            revision = state.revision,
        );
        Ok(())
    }
}

/// Apply the leaves `working` changed relative to `base` onto `target`.
fn merge(
    target: &mut ConfigDocument,
    working: &ConfigDocument,
    base: &ConfigDocument,
) -> Result<()> {
    for change in working.diff(base) {
        target.apply(&change)?;
    }
    Ok(())
}

enum Scope<'a> {
    /// Opened through [`DocumentStore::edit`].
    Store {
        base: ConfigDocument,
        working: ConfigDocument,
        outermost: bool,
    },
    /// Opened through [`EditTransaction::edit`]; borrows the parent's copy.
    Guard(&'a mut ConfigDocument),
}

/// Scoped, mutable working copy of the document.
///
/// Dereferences to [`ConfigDocument`]. Call [`commit`](Self::commit) to keep
/// the changes; dropping the transaction discards them.
pub struct EditTransaction<'a> {
    store: &'a DocumentStore,
    txn: u64,
    scope: Scope<'a>,
    finished: bool,
}

impl<'a> EditTransaction<'a> {
    /// Open a nested scope over the same working copy.
    pub fn edit(&mut self) -> EditTransaction<'_> {
        self.store.enter_nested(self.txn);
        EditTransaction {
            store: self.store,
            txn: self.txn,
            scope: Scope::Guard(self.working_mut()),
            finished: false,
        }
    }

    /// Run `f` in a nested scope; see [`DocumentStore::update`].
    pub fn update<R>(&mut self, f: impl FnOnce(&mut ConfigDocument) -> Result<R>) -> Result<R> {
        let mut nested = self.edit();
        let result = f(&mut *nested)?;
        nested.commit()?;
        Ok(result)
    }

    /// Whether this is the outermost scope.
    pub fn is_outermost(&self) -> bool {
        matches!(self.scope, Scope::Store { outermost: true, .. })
    }

    /// Close the scope normally.
    ///
    /// The outermost scope diffs the working copy against the snapshot taken
    /// when the transaction opened and writes the changed leaves. Nested
    /// scopes only hand their changes to the enclosing transaction.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        match &self.scope {
            Scope::Store {
                base,
                working,
                outermost: true,
            } => self.store.finish_outer(self.txn, base, working),
            Scope::Store { base, working, .. } => self.store.merge_nested(self.txn, base, working),
            Scope::Guard(_) => {
                self.store.leave(self.txn, true);
                Ok(())
            }
        }
    }

    fn working_mut(&mut self) -> &mut ConfigDocument {
        match &mut self.scope {
            Scope::Store { working, .. } => working,
            Scope::Guard(working) => working,
        }
    }
}

impl Deref for EditTransaction<'_> {
    type Target = ConfigDocument;

    fn deref(&self) -> &ConfigDocument {
        match &self.scope {
            Scope::Store { working, .. } => working,
            Scope::Guard(working) => working,
        }
    }
}

impl DerefMut for EditTransaction<'_> {
    fn deref_mut(&mut self) -> &mut ConfigDocument {
        self.working_mut()
    }
}

impl Drop for EditTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.is_outermost() {
            debug!(
                event = "config.edit.discarded",
                path = %self.store.path.display(),
            );
            self.store.discard(self.txn);
        } else {
            self.store.leave(self.txn, false);
        }
    }
}

/// Read and parse the document, creating or recovering it when necessary.
fn load_or_create(path: &Path) -> Result<(KdlDocument, LoadOutcome)> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            write_atomic(path, DEFAULT_DOCUMENT)?;
            info!(event = "config.document.created", path = %path.display());
            return Ok((DEFAULT_DOCUMENT.parse()?, LoadOutcome::Created));
        }
        Err(e) => return Err(e.into()),
    };

    let parsed = String::from_utf8(bytes)
        .map_err(|e| format!("not valid UTF-8: {}", e))
        .and_then(|text| text.parse::<KdlDocument>().map_err(|e| e.to_string()));

    match parsed {
        Ok(kdl) => {
            debug!(event = "config.document.loaded", path = %path.display());
            Ok((kdl, LoadOutcome::Loaded))
        }
        Err(reason) => {
            let backup = backup_path(path);
            std::fs::rename(path, &backup)?;
            write_atomic(path, DEFAULT_DOCUMENT)?;
            warn!(
                event = "config.document.recovered",
                path = %path.display(),
                backup = %backup.display(),
                error = %reason,
                "Config document could not be parsed; recreated defaults"
            );
            Ok((
                DEFAULT_DOCUMENT.parse()?,
                LoadOutcome::Recovered { reason, backup },
            ))
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.bak", path.display()))
}

/// Write via a temp file in the same directory, then rename over the target.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Write one changed leaf into the KDL tree, leaving everything else as is.
fn apply_change(doc: &mut KdlDocument, change: &FieldChange) {
    let segments = change.path.segments();
    let Some((leaf, sections)) = segments.split_last() else {
        return;
    };

    match &change.value {
        Some(value) => {
            let mut current = doc;
            for (depth, name) in sections.iter().enumerate() {
                current = child_block(current, name, depth);
            }
            set_leaf(current, leaf, value, sections.len());
        }
        None => {
            let mut current = doc;
            for name in sections {
                match current.get_mut(name).and_then(|node| node.children_mut().as_mut()) {
                    Some(children) => current = children,
                    None => return,
                }
            }
            remove_leaf(current, leaf);
        }
    }
}

/// Children of the section node `name` at `depth`, creating the node if needed.
fn child_block<'d>(doc: &'d mut KdlDocument, name: &str, depth: usize) -> &'d mut KdlDocument {
    let index = match doc.nodes().iter().position(|n| n.name().value() == name) {
        Some(index) => index,
        None => {
            let mut node = KdlNode::new(name);
            node.set_format(KdlNodeFormat {
                before_children: " ".to_string(),
                ..Default::default()
            });
            node.set_children(empty_block(depth));
            push_node(doc, node, depth);
            doc.nodes().len() - 1
        }
    };

    let node = &mut doc.nodes_mut()[index];
    if node.children().is_none() {
        if let Some(format) = node.format_mut() {
            format.before_children = " ".to_string();
        }
        node.set_children(empty_block(depth));
    }
    node.ensure_children()
}

/// Children block whose closing brace lines up with a node at `depth`.
fn empty_block(depth: usize) -> KdlDocument {
    let mut block = KdlDocument::new();
    block.set_format(KdlDocumentFormat {
        leading: String::new(),
        trailing: INDENT.repeat(depth),
    });
    block
}

/// Replace the first argument of `name`, or append a new leaf node.
fn set_leaf(doc: &mut KdlDocument, name: &str, value: &FieldValue, depth: usize) {
    match doc.get_mut(name) {
        Some(node) => {
            let entries = node.entries_mut();
            match entries.iter().position(|e| e.name().is_none()) {
                Some(index) => {
                    let replaced = entries[index].format().cloned();
                    entries[index] = leaf_entry(value, replaced.as_ref());
                }
                None => entries.insert(0, leaf_entry(value, None)),
            }
        }
        None => {
            let mut node = KdlNode::new(name);
            node.push(leaf_entry(value, None));
            push_node(doc, node, depth);
        }
    }
}

/// Remove the leaf `name`, handing its leading text to the node after it
/// when it opened the block.
fn remove_leaf(doc: &mut KdlDocument, name: &str) {
    let Some(index) = doc.nodes().iter().position(|n| n.name().value() == name) else {
        return;
    };
    let removed = doc.nodes_mut().remove(index);
    if index != 0 {
        return;
    }
    let leading = removed.format().map(|f| f.leading.clone());
    if let (Some(leading), Some(next)) = (leading, doc.nodes_mut().first_mut()) {
        if let Some(format) = next.format_mut() {
            format.leading = leading;
        }
    }
}

/// Entry holding `value`, keeping the spacing around the value it replaces.
fn leaf_entry(value: &FieldValue, replaced: Option<&KdlEntryFormat>) -> KdlEntry {
    let mut entry = KdlEntry::new(value.to_kdl());
    entry.set_format(KdlEntryFormat {
        value_repr: value_repr(value),
        leading: replaced.map_or_else(|| " ".to_string(), |f| f.leading.clone()),
        trailing: replaced.map(|f| f.trailing.clone()).unwrap_or_default(),
        ..Default::default()
    });
    entry
}

/// KDL text for a leaf value. Strings are always quoted.
fn value_repr(value: &FieldValue) -> String {
    let FieldValue::String(s) = value else {
        return value.to_kdl().to_string();
    };

    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Append `node` to `doc`, laid out like its siblings.
///
/// Blocks written on one line (`window { width 800; }`) get `;`-terminated
/// nodes; everything else gets one node per line at the siblings' indent.
fn push_node(doc: &mut KdlDocument, mut node: KdlNode, depth: usize) {
    let indent = INDENT.repeat(depth);
    let sibling_count = doc.nodes().len();
    let mut format = node.format().cloned().unwrap_or_default();
    format.terminator = "\n".to_string();
    format.trailing = String::new();

    match doc.nodes_mut().last_mut() {
        None if depth == 0 => format.leading = String::new(),
        None => {
            format.leading = format!("\n{}", indent);
            let mut block = doc.format().cloned().unwrap_or_default();
            if block.leading.trim().is_empty() {
                block.leading = String::new();
            }
            if block.trailing.trim().is_empty() {
                block.trailing = INDENT.repeat(depth - 1);
            }
            doc.set_format(block);
        }
        Some(last) => {
            if last.format().is_none() {
                last.set_format(KdlNodeFormat {
                    leading: indent.clone(),
                    ..Default::default()
                });
            }
            let Some(sibling) = last.format_mut() else {
                return;
            };

            if depth > 0 && (sibling.terminator.is_empty() || sibling.terminator == ";") {
                if sibling.terminator.is_empty() {
                    // `width 800 }`: move the space before the brace after the new node.
                    let kept = sibling.before_terminator.trim_end().len();
                    format.trailing = sibling.before_terminator.split_off(kept);
                    sibling.terminator = ";".to_string();
                }
                format.leading = " ".to_string();
                format.terminator = ";".to_string();
            } else {
                if !sibling.terminator.ends_with('\n') {
                    sibling.terminator.push('\n');
                }
                let line = line_indent(&sibling.leading, sibling_count == 1);
                let line = line.unwrap_or(indent.as_str());
                format.leading = if depth == 0 {
                    format!("\n{}", line)
                } else {
                    line.to_string()
                };
            }
        }
    }

    node.set_format(format);
    doc.nodes_mut().push(node);
}

/// Indentation of the line a node starts on, when it can be read from the
/// node's leading text.
fn line_indent(leading: &str, first_in_block: bool) -> Option<&str> {
    let line = match leading.rfind('\n') {
        Some(newline) => &leading[newline + 1..],
        None if first_in_block => return None,
        None => leading,
    };
    line.chars().all(|c| c == ' ' || c == '\t').then_some(line)
}
