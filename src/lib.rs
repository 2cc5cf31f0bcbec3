pub mod header;
pub mod block;
pub mod io_stream;
pub mod codec;
pub mod error;
pub mod pipe;
pub mod source;
pub mod tar_stream;
pub mod sink;
pub mod extract;

pub use header::{FormatError, LzopHeader};
pub use io_stream::{LzopOptions, LzopReader, LzopWriter};
pub use codec::{Codec, CodecError, CodecRegistry, ContainerType};
pub use error::{ExtractAllError, ExtractError, SinkError, SourceFailure};
pub use source::{ArchiveSource, BufferSource, FileSource};
pub use tar_stream::{EntryHeader, EntryKind, TarDemux, TarEntry};
pub use sink::{DigestSink, DirectorySink, DiscardSink, EntrySink, MemorySink};
pub use extract::{extract_all, ExtractOptions, ExtractionReport, Extractor, FailurePolicy, SourceStats};
