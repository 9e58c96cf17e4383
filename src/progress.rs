use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::Context;
use crate::digest::Digest;
use crate::vertex::Vertex;

/// Groups related vertices in client progress displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressGroup {
    pub id: String,
    pub name: String,
    /// Weak groups are hidden unless a strong member reports progress.
    pub weak: bool,
}

/// Status of one vertex as seen by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientVertex {
    pub digest: Digest,
    pub inputs: Vec<Digest>,
    pub name: String,
    pub progress_group: Option<ProgressGroup>,
    pub started: Option<SystemTime>,
    pub completed: Option<SystemTime>,
    pub cached: bool,
    pub error: String,
}

pub(crate) fn init_client_vertex(v: &Arc<dyn Vertex>) -> ClientVertex {
    ClientVertex {
        digest: v.digest(),
        inputs: v.inputs().iter().map(|e| e.vertex.digest()).collect(),
        name: v.name(),
        progress_group: v.options().progress_group.clone(),
        started: None,
        completed: None,
        cached: false,
        error: String::new(),
    }
}

/// One progress event: a record id stable across updates plus the vertex
/// snapshot at the time of writing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: String,
    pub vertex: ClientVertex,
}

pub(crate) type WriterId = Uuid;

/// A handle progress records are written through. Cloning shares the
/// underlying sink; each handle keeps a stable identity so fan-out sets can
/// deduplicate attachments.
#[derive(Clone)]
pub struct Writer {
    id: WriterId,
    sink: Sink,
}

#[derive(Clone)]
enum Sink {
    Pipe(Arc<Pipe>),
    Multi(Arc<MultiWriterInner>),
    Discard,
}

struct Pipe {
    tx: Mutex<Option<Sender<ProgressRecord>>>,
}

impl Writer {
    /// A writer that drops everything.
    pub fn discard() -> Self {
        Writer {
            id: Uuid::new_v4(),
            sink: Sink::Discard,
        }
    }

    pub(crate) fn id(&self) -> WriterId {
        self.id
    }

    pub fn write(&self, rec: ProgressRecord) {
        match &self.sink {
            Sink::Pipe(pipe) => {
                // A closed pipe swallows writes; late events after a job is
                // discarded are expected.
                if let Some(tx) = pipe.tx.lock().unwrap().as_ref() {
                    let _ = tx.send(rec);
                }
            }
            Sink::Multi(inner) => {
                let targets = inner.targets.lock().unwrap();
                for w in targets.values() {
                    w.write(rec.clone());
                }
            }
            Sink::Discard => {}
        }
    }

    pub(crate) fn close(&self) {
        if let Sink::Pipe(pipe) = &self.sink {
            pipe.tx.lock().unwrap().take();
        }
    }
}

/// Broadcasts every record to all attached writers. Attachment is
/// idempotent per writer identity, so repeated fan-out passes over the same
/// ancestry are harmless.
#[derive(Clone)]
pub struct MultiWriter {
    inner: Arc<MultiWriterInner>,
}

struct MultiWriterInner {
    id: WriterId,
    targets: Mutex<HashMap<WriterId, Writer>>,
}

impl MultiWriter {
    pub(crate) fn new() -> Self {
        MultiWriter {
            inner: Arc::new(MultiWriterInner {
                id: Uuid::new_v4(),
                targets: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attaches `w`; returns false if it was already attached.
    pub(crate) fn add(&self, w: Writer) -> bool {
        self.inner
            .targets
            .lock()
            .unwrap()
            .insert(w.id(), w)
            .is_none()
    }

    /// This multi-writer viewed as a writer, e.g. for chaining one vertex's
    /// fan-out into another's after an edge merge.
    pub(crate) fn writer(&self) -> Writer {
        Writer {
            id: self.inner.id,
            sink: Sink::Multi(self.inner.clone()),
        }
    }
}

/// Creates a progress pipe: records written to the writer arrive at the
/// reader until the writer is closed.
pub(crate) fn pipe() -> (Writer, Reader) {
    let (tx, rx) = unbounded();
    let w = Writer {
        id: Uuid::new_v4(),
        sink: Sink::Pipe(Arc::new(Pipe {
            tx: Mutex::new(Some(tx)),
        })),
    };
    (w, Reader { rx })
}

/// The receiving end of a progress pipe.
pub struct Reader {
    rx: Receiver<ProgressRecord>,
}

impl Reader {
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<ProgressRecord> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_iter(&self) -> impl Iterator<Item = ProgressRecord> + '_ {
        self.rx.try_iter()
    }
}

/// Fans one progress pipe out to any number of late subscribers.
pub struct MultiReader {
    inner: Arc<MultiReaderInner>,
}

struct MultiReaderInner {
    source: Mutex<Option<Reader>>,
    subs: Mutex<Vec<Sender<ProgressRecord>>>,
}

impl MultiReader {
    pub(crate) fn new(source: Reader) -> Self {
        MultiReader {
            inner: Arc::new(MultiReaderInner {
                source: Mutex::new(Some(source)),
                subs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribes to the stream. The first subscription starts the
    /// forwarding thread; records arriving before any subscriber are
    /// buffered in the pipe.
    pub fn subscribe(&self) -> Receiver<ProgressRecord> {
        let (tx, rx) = unbounded();
        self.inner.subs.lock().unwrap().push(tx);

        if let Some(source) = self.inner.source.lock().unwrap().take() {
            let inner = self.inner.clone();
            std::thread::spawn(move || {
                while let Ok(rec) = source.rx.recv() {
                    let mut subs = inner.subs.lock().unwrap();
                    subs.retain(|tx| tx.send(rec.clone()).is_ok());
                    if subs.is_empty() {
                        break;
                    }
                }
            });
        }

        rx
    }
}

/// Emits the started record for a vertex and returns a closure that emits
/// the matching completion record.
pub(crate) fn notify_started(
    ctx: &Context,
    v: &ClientVertex,
    cached: bool,
) -> impl FnOnce(Option<&anyhow::Error>, bool) {
    let writer = ctx.progress().cloned().unwrap_or_else(Writer::discard);
    let id = Uuid::new_v4().to_string();

    let mut vertex = v.clone();
    vertex.started = Some(SystemTime::now());
    vertex.completed = None;
    vertex.cached = cached;
    writer.write(ProgressRecord {
        id: id.clone(),
        vertex: vertex.clone(),
    });

    move |err, cached| {
        vertex.completed = Some(SystemTime::now());
        vertex.cached = cached;
        vertex.error = err.map(|e| format!("{e:#}")).unwrap_or_default();
        writer.write(ProgressRecord { id, vertex });
    }
}

/// Replays vertex progress on cache loads; recorded into cache-map options
/// so cache providers can attribute work to the originating vertex.
#[derive(Clone)]
pub struct ProgressController {
    pub digest: Digest,
    pub name: String,
    pub progress_group: Option<ProgressGroup>,
    /// Writes replayed records into the vertex's fan-out.
    pub writer: Writer,
}

/// Key under which the progress controller is stored in cache-map options.
pub const PROGRESS_OPT_KEY: &str = "progress";

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(name: &str) -> ProgressRecord {
        ProgressRecord {
            id: Uuid::new_v4().to_string(),
            vertex: ClientVertex {
                digest: Digest::hash(name.as_bytes()),
                inputs: vec![],
                name: name.to_string(),
                progress_group: None,
                started: None,
                completed: None,
                cached: false,
                error: String::new(),
            },
        }
    }

    #[test]
    fn test_pipe_round_trip() {
        let (w, r) = pipe();
        w.write(record("a"));
        let rec = r.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(rec.vertex.name, "a");

        w.close();
        w.write(record("dropped"));
        assert!(r.recv_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_multi_writer_dedups_attachments() {
        let mw = MultiWriter::new();
        let (w, r) = pipe();
        assert!(mw.add(w.clone()));
        assert!(!mw.add(w.clone()));

        mw.writer().write(record("x"));
        assert!(r.recv_timeout(Duration::from_secs(1)).is_some());
        assert!(r.recv_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_multi_writer_chains() {
        let upstream = MultiWriter::new();
        let downstream = MultiWriter::new();
        let (w, r) = pipe();
        downstream.add(w);
        upstream.add(downstream.writer());

        upstream.writer().write(record("chained"));
        assert_eq!(
            r.recv_timeout(Duration::from_secs(1)).unwrap().vertex.name,
            "chained"
        );
    }

    #[test]
    fn test_multi_reader_buffers_until_subscribe() {
        let (w, r) = pipe();
        let mr = MultiReader::new(r);
        w.write(record("early"));

        let rx = mr.subscribe();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().vertex.name,
            "early"
        );
    }

    #[test]
    fn test_notify_started_completes_with_error() {
        let (w, r) = pipe();
        let ctx = Context::background().with_progress(w);
        let v = record("v").vertex;

        let done = notify_started(&ctx, &v, false);
        done(Some(&anyhow::anyhow!("boom")), false);

        let started = r.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(started.vertex.started.is_some());
        assert!(started.vertex.completed.is_none());

        let completed = r.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(completed.id, started.id);
        assert!(completed.vertex.completed.is_some());
        assert!(completed.vertex.error.contains("boom"));
    }
}
