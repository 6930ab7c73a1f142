//! The state file: an append-only log of JSON patch events.
//!
//! Event 0 creates the document `{"_type": "valuesdiffState", "resources": {}}`.
//! Every later event is a patch against the document produced by the events
//! before it, so replaying the whole file yields the current state, and the
//! file doubles as a history of every applied cycle.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    io::{self, Seek as _, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::{de::IoRead, json, Deserializer, StreamDeserializer, Value};
use valuesdiff_core::{ReconciliationState, StateStore};

const STATE_TYPE: &str = "valuesdiffState";

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEventMeta {
    pub time: String,
    #[serde(flatten)]
    pub other_fields: Value,
}

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// The validated first event, handed out before the rest of `iter`.
    first_event: Option<StateEvent>,
}

impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<StateEventStream<'a, R>> {
        let mut iter = Deserializer::from_reader(reader).into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index: 0, .. })) => ev,
            Some(Ok(StateEvent { index, .. })) => {
                bail!("Expected initial state event with index 0, got {}", index)
            }
            Some(Err(e)) => bail!(
                "State file invalid: error parsing initial state event: {}",
                e
            ),
            None => bail!("State file invalid: no initial state event"),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }
}

impl<'a, R: io::Read> Iterator for StateEventStream<'a, R> {
    type Item = Result<StateEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.first_event.take() {
            Some(ev) => Some(Ok(ev)),
            None => self.iter.next().map(|r| r.map_err(Into::into)),
        }
    }
}

pub fn apply_state_event(state: &mut Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice())
        .with_context(|| format!("Could not apply state event {}", event.index))
}

/// Apply `events` in order, returning how many there were.
pub fn apply_state_events(
    state: &mut Value,
    events: impl Iterator<Item = Result<StateEvent>>,
) -> Result<u64> {
    let mut count = 0;
    for event in events {
        apply_state_event(state, &event?)?;
        count += 1;
    }
    Ok(count)
}

/// An open state file.
///
/// After [`read`](StateHandle::read), an [`append`](StateHandle::append) only
/// goes through if nobody else wrote to the file in between, so events are
/// never appended to a document they were not computed from.
pub struct StateHandle {
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    expected_size: Option<u64>,
    next_index: u64,
}

impl StateHandle {
    pub fn open<P: AsRef<Path>>(path: P, create_new: bool) -> Result<StateHandle> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(create_new)
            .open(path)?;
        let file = Arc::new(file);
        let locking = fd_lock::RwLock::new(file.clone());
        let mut handle = StateHandle {
            file,
            locking,
            expected_size: None,
            next_index: 0,
        };
        if create_new {
            handle.append(&[&Self::init_event()?])?;
        }
        Ok(handle)
    }

    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<StateHandle> {
        match Self::open(path.as_ref(), true) {
            Err(e) if is_io_error(&e, io::ErrorKind::AlreadyExists) => Self::open(path, false),
            r => r,
        }
    }

    fn init_event() -> Result<StateEvent> {
        Ok(StateEvent {
            index: 0,
            meta: StateEventMeta {
                time: Utc::now().to_rfc3339(),
                other_fields: json!({}),
            },
            patch: json_patch::Patch(vec![json_patch::PatchOperation::Add(
                json_patch::AddOperation {
                    path: "".parse()?,
                    value: json!({
                        "_type": STATE_TYPE,
                        "resources": {},
                    }),
                },
            )]),
        })
    }

    /// Replay the file into a document.
    pub fn read(&mut self) -> Result<Value> {
        let lock_guard = self.locking.read()?;
        let mut reader = &*self.file;
        reader.seek(io::SeekFrom::Start(0))?;
        let stream = StateEventStream::open_from_reader(io::BufReader::new(reader))?;
        let mut state = json!({});
        let count = apply_state_events(&mut state, stream)?;
        let size = (&*self.file).seek(io::SeekFrom::End(0))?;
        drop(lock_guard);

        check_document(&state)?;
        self.expected_size = Some(size);
        self.next_index = count;
        Ok(state)
    }

    /// Index for the next event appended through this handle.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn append(&mut self, events: &[&StateEvent]) -> Result<()> {
        tracing::debug!("acquiring state file write lock");
        let lock_guard = self.locking.write()?;
        let pos = (&*self.file).seek(io::SeekFrom::End(0))?;
        if let Some(expected_size) = self.expected_size {
            if pos != expected_size {
                bail!(
                    "Detected concurrent writing to the state file (foreign bytes [{}..{})); nothing was written",
                    expected_size,
                    pos
                );
            }
        }

        let mut writer = io::BufWriter::new(&*self.file);
        for event in events {
            // Pretty, so that the history can be read by humans.
            serde_json::to_writer_pretty(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);

        self.expected_size = Some((&*self.file).stream_position()?);
        self.next_index += events.len() as u64;
        drop(lock_guard);
        Ok(())
    }
}

fn check_document(document: &Value) -> Result<()> {
    match document.get("_type").and_then(Value::as_str) {
        Some(STATE_TYPE) => {}
        Some(t) => bail!("Not a valuesdiff state file: unexpected _type {}", t),
        None => bail!("Not a valuesdiff state file: missing _type"),
    }
    if !document.get("resources").is_some_and(Value::is_object) {
        bail!("State file invalid: `resources` is not an object");
    }
    Ok(())
}

fn is_io_error(e: &anyhow::Error, kind: io::ErrorKind) -> bool {
    e.downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == kind)
}

/// A [`StateStore`] backed by a state file.
///
/// Loading a resource remembers what was read. Storing it again is refused
/// when another process changed that resource in the meantime.
pub struct FileStore {
    path: PathBuf,
    seen: Mutex<HashMap<String, Option<Value>>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore {
            path: path.into(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current document, or `None` if the file does not exist yet.
    fn read_document(&self) -> Result<Option<Value>> {
        match StateHandle::open(&self.path, false) {
            Ok(mut handle) => handle
                .read()
                .map(Some)
                .with_context(|| format!("Could not read state file {}", self.path.display())),
            Err(e) if is_io_error(&e, io::ErrorKind::NotFound) => Ok(None),
            Err(e) => {
                Err(e.context(format!("Could not open state file {}", self.path.display())))
            }
        }
    }

    /// Every stored resource; empty when there is no state file.
    pub fn read_resources(&self) -> Result<BTreeMap<String, ReconciliationState>> {
        let Some(document) = self.read_document()? else {
            return Ok(BTreeMap::new());
        };
        serde_json::from_value(document["resources"].clone())
            .with_context(|| "Could not deserialize resources from the state file")
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<Value>>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn resource_entry(document: &Value, name: &str) -> Option<Value> {
    document["resources"].get(name).cloned()
}

impl StateStore for FileStore {
    fn load(&self, name: &str) -> Result<Option<ReconciliationState>> {
        let entry = self
            .read_document()?
            .and_then(|document| resource_entry(&document, name));
        let state = entry
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("Could not deserialize the state of resource `{}`", name))?;
        self.seen().insert(name.to_string(), entry);
        Ok(state)
    }

    fn store(&self, name: &str, state: &ReconciliationState) -> Result<()> {
        let mut handle = StateHandle::open_or_create(&self.path)
            .with_context(|| format!("Could not open state file {}", self.path.display()))?;
        let document = handle.read()?;
        let current = resource_entry(&document, name);
        if let Some(seen) = self.seen().get(name) {
            if *seen != current {
                bail!(
                    "The state of resource `{}` was changed by another process since it was read",
                    name
                );
            }
        }

        let entry = serde_json::to_value(state)?;
        let mut updated = document.clone();
        updated["resources"][name] = entry.clone();
        let patch = json_patch::diff(&document, &updated);
        if !patch.0.is_empty() {
            let event = StateEvent {
                index: handle.next_index(),
                meta: StateEventMeta {
                    time: Utc::now().to_rfc3339(),
                    other_fields: json!({ "resource": name }),
                },
                patch,
            };
            handle.append(&[&event])?;
            tracing::debug!(name, index = event.index, "appended state event");
        }
        self.seen().insert(name.to_string(), Some(entry));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valuesdiff_core::{CycleInput, Gate, Reconciler, Snapshot};

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2019-03-04T07:40:00Z"},
        "patch": [
            {
                "op": "add",
                "value": { "_type": "valuesdiffState", "resources": {} },
                "path": ""
            }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2019-03-04T07:41:00Z", "resource": "a"},
        "patch": [
            {
                "op": "add",
                "value": {
                    "identifier": "diff",
                    "is_initiated": true,
                    "values": {"k": "v"},
                    "last_values": {},
                    "created": ["k"],
                    "updated": [],
                    "deleted": [],
                    "commit_expression": "true",
                    "is_committed": true
                },
                "path": "/resources/a"
            }
        ]
    }
"#;

    fn input(entries: &[(&str, &str)]) -> CycleInput {
        CycleInput::new(entries.iter().copied().collect::<Snapshot>())
    }

    #[test]
    fn test_open_state_stream() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        let second = events[1].as_ref().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.meta.time, "2019-03-04T07:41:00Z");
        assert_eq!(second.meta.other_fields, json!({"resource": "a"}));
    }

    #[test]
    fn test_resolve_state() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let mut state = json!({});
        assert_eq!(apply_state_events(&mut state, stream).unwrap(), 2);
        let resource: ReconciliationState =
            serde_json::from_value(state["resources"]["a"].clone()).unwrap();
        assert_eq!(resource.created, vec!["k".to_string()]);
        assert!(resource.is_committed);
    }

    #[test]
    fn test_open_state_stream_invalid() {
        for input in [
            r#"{"index":1,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#,
            r#"{"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#,
            r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]"#,
            r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"}}"#,
            "",
            "[]",
        ] {
            assert!(
                StateEventStream::open_from_reader(input.as_bytes()).is_err(),
                "{}",
                input
            );
        }
    }

    #[test]
    fn test_invalid_second_event() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}
{"meta":{"time":"2019-06-04T07:40:00Z"}}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        let events: Vec<Result<StateEvent>> = stream.collect();
        assert!(events[1].is_err());
    }

    #[test]
    fn test_new_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut handle = StateHandle::open(&path, true).unwrap();
        assert_eq!(
            handle.read().unwrap(),
            json!({"_type": "valuesdiffState", "resources": {}})
        );
        assert_eq!(handle.next_index(), 1);
        assert!(StateHandle::open(&path, true).is_err());
        StateHandle::open_or_create(&path).unwrap();
    }

    #[test]
    fn test_foreign_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[{"op":"add","path":"","value":{"_type":"terraformState","resources":{}}}]}"#,
        )
        .unwrap();
        let err = FileStore::new(&path).load("a").unwrap_err();
        assert!(format!("{:#}", err).contains("unexpected _type terraformState"));
    }

    #[test]
    fn test_concurrent_append_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut first = StateHandle::open_or_create(&path).unwrap();
        let mut second = StateHandle::open_or_create(&path).unwrap();
        first.read().unwrap();
        second.read().unwrap();

        let event = |index| StateEvent {
            index,
            meta: StateEventMeta {
                time: "2019-03-04T07:41:00Z".to_owned(),
                other_fields: json!({}),
            },
            patch: json_patch::diff(
                &json!({"_type": "valuesdiffState", "resources": {}}),
                &json!({"_type": "valuesdiffState", "resources": {"x": {}}}),
            ),
        };
        second.append(&[&event(1)]).unwrap();
        let err = first.append(&[&event(1)]).unwrap_err();
        assert!(err.to_string().starts_with("Detected concurrent writing"));

        let mut reader = StateHandle::open(&path, false).unwrap();
        assert_eq!(reader.read().unwrap()["resources"], json!({"x": {}}));
        assert_eq!(reader.next_index(), 2);
    }

    #[test]
    fn test_file_store_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let reconciler = Reconciler::new(FileStore::new(&path), Gate::default());

        assert_eq!(reconciler.state("a").unwrap(), None);
        assert!(!path.exists());

        reconciler.apply("a", &input(&[("1", "a"), ("2", "b")])).unwrap();
        let second = reconciler
            .apply(
                "a",
                &input(&[("1", "a")]).with_commit_expression("deleted.length === 0"),
            )
            .unwrap();
        assert!(!second.state.is_committed);
        reconciler.apply("b", &input(&[("x", "y")])).unwrap();

        // A fresh store sees what the first one wrote.
        let resources = FileStore::new(&path).read_resources().unwrap();
        assert_eq!(resources.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(resources["a"], second.state);

        let contents = std::fs::read_to_string(&path).unwrap();
        let events: Vec<_> = StateEventStream::open_from_reader(contents.as_bytes())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            events.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(events[3].meta.other_fields, json!({"resource": "b"}));
    }

    #[test]
    fn test_file_store_detects_foreign_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let ours = FileStore::new(&path);
        let theirs = FileStore::new(&path);
        let gate = Gate::default();

        let state = valuesdiff_core::reconcile::initiate(&input(&[("k", "v")]), &gate).unwrap();
        assert_eq!(ours.load("r").unwrap(), None);
        assert_eq!(theirs.load("r").unwrap(), None);
        theirs.store("r", &state).unwrap();

        let err = ours.store("r", &state).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The state of resource `r` was changed by another process since it was read"
        );

        // Once reloaded, storing works again.
        assert_eq!(ours.load("r").unwrap(), Some(state.clone()));
        ours.store("r", &state).unwrap();
    }
}
