//! Extraction orchestrator.
//!
//! # Per source
//! 1. Resolve the codec for the declared container type.  An unknown or
//!    unregistered type fails here, before the source is opened.
//! 2. Open the source.
//! 3. Spawn a scoped producer thread that decodes the stream into a bounded
//!    [`pipe`](crate::pipe).  The calling thread reads the other end through
//!    a [`TarDemux`] and hands each entry to the sink.
//! 4. Join the producer.  A decoder failure wins over whatever the consumer
//!    saw, since a broken container explains a broken tar stream.
//!
//! The scope guarantees the producer is joined and the pipe, the codec state
//! and the source stream are released on every path.  When the consumer
//! stops early it drops its end of the pipe, which makes the producer's next
//! write fail with `BrokenPipe`, so neither side can block forever.
//!
//! # Many sources
//! Sources are independent.  With the `parallel` feature and
//! `concurrency > 1` they run on a dedicated rayon pool, one pipe pair each;
//! otherwise one after another.  There is no ordering between entries of
//! different sources.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::codec::{CodecError, CodecRegistry, ContainerType};
use crate::error::{ExtractAllError, ExtractError, SourceFailure};
use crate::pipe::{pipe, PipeReader, DEFAULT_CHUNK_SIZE, DEFAULT_SLOTS};
use crate::sink::EntrySink;
use crate::source::ArchiveSource;
use crate::tar_stream::TarDemux;

// ── Options ──────────────────────────────────────────────────────────────────

/// What to do with the remaining sources once one has failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and keep going.
    #[default]
    BestEffort,
    /// Start no new source after the first failure.  Sources already
    /// running finish; the rest are reported as skipped.
    AbortOnFirst,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Sources extracted at once.  Values above one need the `parallel`
    /// feature.
    pub concurrency:     usize,
    pub failure_policy:  FailurePolicy,
    /// Chunks the pipe holds before the decoder blocks.
    pub pipe_slots:      usize,
    pub pipe_chunk_size: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            concurrency:     1,
            failure_policy:  FailurePolicy::BestEffort,
            pipe_slots:      DEFAULT_SLOTS,
            pipe_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub path:      String,
    pub container: ContainerType,
    /// Entries handed to the sink.
    pub entries:   u64,
    /// Sum of the declared sizes of those entries.
    pub bytes:     u64,
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    /// One record per source that was started, in input order.
    pub sources:  Vec<SourceStats>,
    pub failures: Vec<SourceFailure>,
    /// Sources never started because of [`FailurePolicy::AbortOnFirst`].
    pub skipped:  Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FailureSummary<'a> {
    pub path:    &'a str,
    pub kind:    &'static str,
    pub message: String,
}

/// Serializable view of an [`ExtractionReport`].
#[derive(Debug, Serialize)]
pub struct ReportSummary<'a> {
    pub entries:  u64,
    pub bytes:    u64,
    pub sources:  &'a [SourceStats],
    pub failures: Vec<FailureSummary<'a>>,
    pub skipped:  &'a [String],
}

impl ExtractionReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }

    pub fn entries(&self) -> u64 {
        self.sources.iter().map(|s| s.entries).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.sources.iter().map(|s| s.bytes).sum()
    }

    pub fn summary(&self) -> ReportSummary<'_> {
        ReportSummary {
            entries:  self.entries(),
            bytes:    self.bytes(),
            sources:  &self.sources,
            failures: self
                .failures
                .iter()
                .map(|f| FailureSummary {
                    path:    &f.path,
                    kind:    f.error.kind(),
                    message: f.error.to_string(),
                })
                .collect(),
            skipped:  &self.skipped,
        }
    }

    /// `Ok` only if every source was extracted without a single failure.
    ///
    /// Skipped sources always come with the failure that caused the abort,
    /// so they never turn a clean report into an error on their own.
    pub fn into_result(self) -> Result<(), ExtractAllError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ExtractAllError { failures: self.failures })
        }
    }

    fn absorb(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done { stats, failures } => {
                self.failures.extend(failures.into_iter().map(|error| SourceFailure {
                    path: stats.path.clone(),
                    error,
                }));
                self.sources.push(stats);
            }
            Outcome::Skipped(path) => self.skipped.push(path),
        }
    }
}

enum Outcome {
    Done { stats: SourceStats, failures: Vec<ExtractError> },
    Skipped(String),
}

impl Outcome {
    fn failed(&self) -> bool {
        matches!(self, Outcome::Done { failures, .. } if !failures.is_empty())
    }
}

// ── Extractor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Extractor {
    registry: CodecRegistry,
    options:  ExtractOptions,
}

impl Extractor {
    pub fn new(registry: CodecRegistry, options: ExtractOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    /// Extract every source into `sink`.  Never fails as a whole; look at
    /// the report, or call [`ExtractionReport::into_result`].
    pub fn run<S, A>(&self, sink: &S, sources: &[A]) -> ExtractionReport
    where
        S: EntrySink + ?Sized,
        A: ArchiveSource,
    {
        let started = Instant::now();
        let outcomes = self.run_all(sink, sources);

        let mut report = ExtractionReport::default();
        for outcome in outcomes {
            report.absorb(outcome);
        }
        info!(
            sources  = sources.len(),
            entries  = report.entries(),
            bytes    = report.bytes(),
            failures = report.failures.len(),
            skipped  = report.skipped.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction finished"
        );
        report
    }

    fn run_all<S, A>(&self, sink: &S, sources: &[A]) -> Vec<Outcome>
    where
        S: EntrySink + ?Sized,
        A: ArchiveSource,
    {
        let abort = self.options.failure_policy == FailurePolicy::AbortOnFirst;
        let aborted = AtomicBool::new(false);
        let task = |source: &A| -> Outcome {
            if aborted.load(Ordering::Acquire) {
                return Outcome::Skipped(source.path().to_owned());
            }
            let outcome = self.extract_source(sink, source);
            if abort && outcome.failed() {
                aborted.store(true, Ordering::Release);
            }
            outcome
        };

        #[cfg(feature = "parallel")]
        if self.options.concurrency > 1 && sources.len() > 1 {
            use rayon::prelude::*;

            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.options.concurrency)
                .thread_name(|i| format!("lzx-source-{i}"))
                .build()
            {
                Ok(pool) => return pool.install(|| sources.par_iter().map(&task).collect()),
                Err(e) => warn!(error = %e, "cannot build worker pool; extracting sequentially"),
            }
        }

        #[cfg(not(feature = "parallel"))]
        if self.options.concurrency > 1 {
            debug!("built without the parallel feature; extracting sequentially");
        }

        sources.iter().map(&task).collect()
    }

    fn extract_source<S, A>(&self, sink: &S, source: &A) -> Outcome
    where
        S: EntrySink + ?Sized,
        A: ArchiveSource + ?Sized,
    {
        let path = source.path();
        let container = source.container_type();
        let mut stats = SourceStats { path: path.to_owned(), container, entries: 0, bytes: 0 };
        let mut failures = Vec::new();

        if let Err(e) = self.extract_stream(sink, source, &mut stats, &mut failures) {
            failures.push(e);
        }
        for e in &failures {
            warn!(source = path, kind = e.kind(), error = %e, "extraction failure");
        }
        debug!(source = path, entries = stats.entries, bytes = stats.bytes, "source done");
        Outcome::Done { stats, failures }
    }

    /// Run one source end to end.  Sink failures go to `failures`; the
    /// returned error is the one that ended the source.
    fn extract_stream<S, A>(
        &self,
        sink:     &S,
        source:   &A,
        stats:    &mut SourceStats,
        failures: &mut Vec<ExtractError>,
    ) -> Result<(), ExtractError>
    where
        S: EntrySink + ?Sized,
        A: ArchiveSource + ?Sized,
    {
        let path = source.path();
        let codec = self.registry.lookup(stats.container)?;
        debug!(source = path, container = %stats.container, "codec selected");

        let mut stream = source.open().map_err(|e| ExtractError::Resource {
            path:   path.to_owned(),
            source: e,
        })?;
        let (mut writer, reader) = pipe(self.options.pipe_slots, self.options.pipe_chunk_size);

        thread::scope(|scope| {
            let producer = thread::Builder::new()
                .name("lzx-decode".into())
                .spawn_scoped(scope, move || {
                    let result = codec.decompress_stream(&mut stream, &mut writer);
                    match &result {
                        Ok(n) => trace!(decoded = n, "decoder finished"),
                        Err(e) if !e.is_closed_pipe() => {
                            writer.fail(io::Error::new(io::ErrorKind::Other, format!("decoder failed: {e}")))
                        }
                        Err(_) => {}
                    }
                    result
                })
                .map_err(|e| ExtractError::Resource { path: path.to_owned(), source: e })?;

            let consumed = consume(sink, path, reader, stats, failures);
            let produced = producer
                .join()
                .unwrap_or_else(|_| Err(CodecError::Decompression("decoder thread panicked".into())));
            reconcile(path, produced, consumed)
        })
    }
}

/// Drive the tar demultiplexer over the decoded stream.  The reader is
/// dropped on return, which releases a producer still blocked on the pipe.
fn consume<S: EntrySink + ?Sized>(
    sink:     &S,
    path:     &str,
    reader:   PipeReader,
    stats:    &mut SourceStats,
    failures: &mut Vec<ExtractError>,
) -> Result<(), ExtractError> {
    let mut archive = tar::Archive::new(reader);
    let mut demux = TarDemux::new(&mut archive)?;

    while let Some(entry) = demux.next_entry() {
        let mut entry = entry?;
        let header = entry.header().clone();
        trace!(source = path, entry = %header.name, size = header.size, offset = entry.offset(), "entry");

        let sunk = sink.consume(path, &header, &mut entry);
        let drained = entry.drain();
        match (sunk, drained) {
            (Ok(()), Ok(_)) => {}
            (Err(e), Ok(_)) => failures.push(ExtractError::Sink { entry: header.name.clone(), source: e }),
            (sunk, Err(e)) => {
                // the body itself broke; that is what the sink tripped over
                if let Err(s) = sunk {
                    debug!(source = path, entry = %header.name, error = %s, "sink error superseded");
                }
                return Err(e);
            }
        }
        stats.entries += 1;
        stats.bytes += header.size;
    }
    drop(demux);

    // Zero padding after the end-of-archive marker; reading it lets the
    // decoder reach the end of its container and report trailing damage.
    let mut rest = archive.into_inner();
    let offset = rest.bytes_read;
    io::copy(&mut rest, &mut io::sink()).map_err(|e| ExtractError::Parse {
        offset,
        message: format!("after end of archive: {e}"),
    })?;
    Ok(())
}

fn reconcile(
    path:     &str,
    produced: Result<u64, CodecError>,
    consumed: Result<(), ExtractError>,
) -> Result<(), ExtractError> {
    match (produced, consumed) {
        (Ok(_), consumed) => consumed,
        (Err(e), consumed) if !e.is_closed_pipe() => {
            if let Err(c) = consumed {
                debug!(source = path, error = %c, "consumer error superseded by decoder failure");
            }
            Err(e.into())
        }
        (Err(e), Err(c)) => {
            debug!(source = path, error = %e, "decoder stopped after consumer failure");
            Err(c)
        }
        (Err(e), Ok(())) => {
            warn!(source = path, error = %e, "decoder lost its output after a complete read");
            Ok(())
        }
    }
}

/// Extract every source into `sink` with the built-in codecs and default
/// options.
///
/// An empty `sources` slice succeeds without touching the sink.
pub fn extract_all<S, A>(sink: &S, sources: &[A]) -> Result<(), ExtractAllError>
where
    S: EntrySink + ?Sized,
    A: ArchiveSource,
{
    Extractor::default().run(sink, sources).into_result()
}
