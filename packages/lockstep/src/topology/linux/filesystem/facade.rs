#![cfg_attr(coverage_nightly, coverage(off))]

use std::fmt::Debug;
#[cfg(test)]
use std::sync::Arc;

use crate::ProcessorId;
#[cfg(test)]
use crate::topology::linux::MockFilesystem;
use crate::topology::linux::{BuildTargetFilesystem, Filesystem};

/// Hides the real/mock choice behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum FilesystemFacade {
    Target(&'static BuildTargetFilesystem),

    #[cfg(test)]
    Mock(Arc<MockFilesystem>),
}

impl FilesystemFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetFilesystem)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockFilesystem) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Filesystem for FilesystemFacade {
    fn get_online_processors_contents(&self) -> Option<String> {
        match self {
            Self::Target(fs) => fs.get_online_processors_contents(),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_online_processors_contents(),
        }
    }

    fn get_thread_siblings_contents(&self, processor: ProcessorId) -> Option<String> {
        match self {
            Self::Target(fs) => fs.get_thread_siblings_contents(processor),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_thread_siblings_contents(processor),
        }
    }

    fn get_cache_attribute_contents(
        &self,
        processor: ProcessorId,
        index: u32,
        attribute: &str,
    ) -> Option<String> {
        match self {
            Self::Target(fs) => fs.get_cache_attribute_contents(processor, index, attribute),
            #[cfg(test)]
            Self::Mock(mock) => mock.get_cache_attribute_contents(processor, index, attribute),
        }
    }
}

impl Debug for FilesystemFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
