//! Options for reading and writing documents.

use std::fmt;
use std::sync::Arc;

use educe::Educe;
use serde::{Deserialize, Serialize};

use crate::compress::Compressor;
use crate::deferred::CancelToken;
use crate::lookback::IdWriteMode;
use crate::registry::IdRemap;

/// What to do with the body when reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyMode {
    /// Decompress and parse the node graph.
    #[default]
    Parse,
    /// Keep the body bytes exactly as stored, without decompressing them. The document can still
    /// be written back out.
    KeepRaw,
    /// Stop after the reference table. The document can't be written back out.
    Skip,
}

/// Where a read currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Header,
    HeaderChunk,
    BodyChunk,
    Body,
}

/// A progress event. `position` and `total` are byte offsets into the section named by `stage`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    pub position: usize,
    pub total: usize,
    pub chunk_id: Option<u32>,
}

/// Receives progress events during a read. Called on the reading thread, so keep it quick.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}

impl<F: Fn(Progress) + Send + Sync> ProgressSink for F {
    fn report(&self, progress: Progress) {
        self(progress)
    }
}

/// Options for [`Document::read`][crate::Document::read].
///
/// ```
/// # use gbx_pack::{BodyMode, ReadSettings};
/// let settings = ReadSettings::new().body_mode(BodyMode::KeepRaw);
/// assert_eq!(settings.get_body_mode(), BodyMode::KeepRaw);
/// ```
#[derive(Clone, Educe)]
#[educe(Default)]
pub struct ReadSettings {
    compressor: Option<Arc<dyn Compressor>>,
    body_mode: BodyMode,
    progress: Option<Arc<dyn ProgressSink>>,
    cancel: Option<CancelToken>,
}

impl ReadSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the provider used to decompress compressed bodies.
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn body_mode(mut self, mode: BodyMode) -> Self {
        self.body_mode = mode;
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Check `token` between top-level chunks and abort with [`Error::Cancelled`] once it fires.
    ///
    /// [`Error::Cancelled`]: crate::Error::Cancelled
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn get_compressor(&self) -> Option<&Arc<dyn Compressor>> {
        self.compressor.as_ref()
    }

    pub fn get_body_mode(&self) -> BodyMode {
        self.body_mode
    }

    pub fn get_cancel(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    pub(crate) fn report(&self, stage: Stage, position: usize, total: usize, chunk_id: Option<u32>) {
        if let Some(sink) = &self.progress {
            sink.report(Progress {
                stage,
                position,
                total,
                chunk_id,
            });
        }
    }
}

impl fmt::Debug for ReadSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSettings")
            .field("compressor", &self.compressor.as_ref().map(|c| c.name().to_owned()))
            .field("body_mode", &self.body_mode)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Options for [`Document::write`][crate::Document::write].
#[derive(Clone, Educe)]
#[educe(Default)]
pub struct WriteSettings {
    compressor: Option<Arc<dyn Compressor>>,
    remap: IdRemap,
    id_mode: IdWriteMode,
}

impl WriteSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the provider used to compress the body, when the header asks for a compressed one.
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn remap(mut self, remap: IdRemap) -> Self {
        self.remap = remap;
        self
    }

    pub fn id_mode(mut self, mode: IdWriteMode) -> Self {
        self.id_mode = mode;
        self
    }

    pub fn get_compressor(&self) -> Option<&Arc<dyn Compressor>> {
        self.compressor.as_ref()
    }

    pub fn get_remap(&self) -> IdRemap {
        self.remap
    }

    pub fn get_id_mode(&self) -> IdWriteMode {
        self.id_mode
    }
}

impl fmt::Debug for WriteSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSettings")
            .field("compressor", &self.compressor.as_ref().map(|c| c.name().to_owned()))
            .field("remap", &self.remap)
            .field("id_mode", &self.id_mode)
            .finish()
    }
}
