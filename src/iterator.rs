//! Forward-only iteration over a container stream.
//!
//! Each fetch reads one container, asks the security filter whether its
//! start position is in scope, sets up that container's key material and
//! decrypts the sensitive block.  A rejected position ends the stream; no
//! key setup happens for it or anything after it.
//!
//! The iterator buffers at most one container ahead of the caller.  Once it
//! reports the end of the stream it stays there, including after an error.

use std::io::Read;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::container::{read_container, Container, ContainerError};
use crate::crypto::{CryptoError, SecurityFilter};

#[derive(Error, Debug)]
pub enum IterError {
    /// The byte stream is corrupt or truncated.
    #[error("Malformed container stream: {0}")]
    Format(#[from] ContainerError),
    /// The runtime cannot provide the container's key material.
    #[error("Cannot set up encryption for container {container_id}: {source}")]
    CryptoSetup {
        container_id: u32,
        #[source]
        source: CryptoError,
    },
    #[error("Cannot decrypt sensitive block of container {container_id}: {source}")]
    Decrypt {
        container_id: u32,
        #[source]
        source: CryptoError,
    },
    #[error("Container {container_id} has no sensitive block")]
    MissingSensitiveBlock { container_id: u32 },
}

impl IterError {
    /// `true` when the failure lies in the environment rather than the data.
    pub fn is_environmental(&self) -> bool {
        matches!(self, IterError::CryptoSetup { .. })
    }
}

/// Time spent per phase, accumulated over the iterator's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterTimings {
    pub io:         Duration,
    pub decryption: Duration,
    /// Containers delivered with their sensitive block decrypted.
    pub containers: u64,
}

pub struct ContainerIterator<R: Read, F: SecurityFilter> {
    reader:  Option<R>,
    filter:  F,
    next:    Option<Container>,
    eof:     bool,
    timings: IterTimings,
}

impl<R: Read, F: SecurityFilter> ContainerIterator<R, F> {
    pub fn new(reader: R, filter: F) -> Self {
        Self {
            reader: Some(reader),
            filter,
            next: None,
            eof: false,
            timings: IterTimings::default(),
        }
    }

    /// Pull the next container, decrypted.
    ///
    /// Returns a container buffered by [`has_next`](Self::has_next) first.
    /// `Ok(None)` means end of stream or a rejected position.  An error is
    /// returned once; every later call yields `Ok(None)`.
    pub fn try_fetch_next(&mut self) -> Result<Option<Container>, IterError> {
        if let Some(container) = self.next.take() {
            return Ok(Some(container));
        }
        if self.eof {
            return Ok(None);
        }
        match self.fetch() {
            Ok(Some(container)) => Ok(Some(container)),
            Ok(None) => {
                self.eof = true;
                Ok(None)
            }
            Err(e) => {
                self.eof = true;
                Err(e)
            }
        }
    }

    pub fn has_next(&mut self) -> Result<bool, IterError> {
        if self.next.is_none() && !self.eof {
            self.next = self.try_fetch_next()?;
        }
        Ok(self.next.is_some())
    }

    pub fn next_container(&mut self) -> Result<Option<Container>, IterError> {
        if self.has_next()? {
            Ok(self.next.take())
        } else {
            Ok(None)
        }
    }

    /// Discard any buffered container and release the stream.  Safe to call
    /// more than once.
    pub fn close(&mut self) {
        self.next = None;
        self.eof = true;
        if self.reader.take().is_some() {
            debug!(
                containers = self.timings.containers,
                io = ?self.timings.io,
                decryption = ?self.timings.decryption,
                "container stream closed"
            );
        }
    }

    pub fn timings(&self) -> IterTimings {
        self.timings
    }

    pub fn security_filter(&self) -> &F {
        &self.filter
    }

    /// Consume the iterator, releasing the stream, and hand back the filter.
    pub fn into_filter(mut self) -> F {
        self.close();
        self.filter
    }

    fn fetch(&mut self) -> Result<Option<Container>, IterError> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => return Ok(None),
        };

        let started = Instant::now();
        let read = read_container(reader);
        self.timings.io += started.elapsed();

        let mut container = match read? {
            Some(c) => c,
            None => {
                debug!("container stream exhausted");
                return Ok(None);
            }
        };
        let container_id = container.container_id;
        debug!(container_id, pos = container.absolute_pos_start, "container fetched");

        if !self.filter.is_container_permitted(container.absolute_pos_start) {
            debug!(container_id, pos = container.absolute_pos_start, "container not permitted, ending stream");
            return Ok(None);
        }

        let started = Instant::now();
        self.filter
            .init_container_encryption(container.container_salt, container_id)
            .map_err(|source| IterError::CryptoSetup { container_id, source })?;

        let block = container
            .sensitive_block_mut()
            .ok_or(IterError::MissingSensitiveBlock { container_id })?;
        let ciphertext = block.compressed_content().map_err(ContainerError::from)?;
        let plaintext = self
            .filter
            .decrypt_block(ciphertext, container_id)
            .map_err(|source| IterError::Decrypt { container_id, source })?;
        block.set_content(plaintext.clone(), plaintext);

        self.timings.decryption += started.elapsed();
        self.timings.containers += 1;
        debug!(container_id, "sensitive block decrypted");
        Ok(Some(container))
    }
}

impl<R: Read, F: SecurityFilter> Iterator for ContainerIterator<R, F> {
    type Item = Result<Container, IterError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_fetch_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::codec::CompressionMethod;
    use crate::container::SENSITIVE_BLOCK_CONTENT_ID;
    use std::cell::Cell;
    use std::io::Cursor;

    const MASK: u8 = 0x5a;

    /// XOR "cipher" that records every call.
    #[derive(Default)]
    struct CountingFilter {
        rejected_from: Option<u64>,
        inits:         Vec<u32>,
        decrypts:      Cell<usize>,
        fail_setup:    bool,
    }

    impl SecurityFilter for CountingFilter {
        fn is_container_permitted(&self, pos: u64) -> bool {
            self.rejected_from.map_or(true, |limit| pos < limit)
        }

        fn init_container_encryption(&mut self, _salt: u64, container_id: u32) -> Result<(), CryptoError> {
            if self.fail_setup {
                return Err(CryptoError::AlgorithmUnavailable("AES/GCM".into()));
            }
            self.inits.push(container_id);
            Ok(())
        }

        fn decrypt_block(&self, ciphertext: &[u8], container_id: u32) -> Result<Vec<u8>, CryptoError> {
            if self.inits.last() != Some(&container_id) {
                return Err(CryptoError::NotInitialized { container_id });
            }
            self.decrypts.set(self.decrypts.get() + 1);
            Ok(ciphertext.iter().map(|b| b ^ MASK).collect())
        }
    }

    fn stream(positions: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (i, &pos) in positions.iter().enumerate() {
            let id = i as u32;
            let sealed: Vec<u8> = format!("payload-{id}").bytes().map(|b| b ^ MASK).collect();
            let mut c = Container::new(id, pos, pos + 39, 77);
            c.add_block(Block::core(vec![id as u8; 3])).unwrap();
            c.add_block(Block::external(CompressionMethod::Raw, SENSITIVE_BLOCK_CONTENT_ID, sealed)).unwrap();
            c.write(&mut buf).unwrap();
        }
        buf
    }

    fn plaintext(c: &mut Container) -> Vec<u8> {
        c.sensitive_block_mut().unwrap().raw_content().unwrap().to_vec()
    }

    #[test]
    fn yields_decrypted_containers_until_rejection() {
        let filter = CountingFilter { rejected_from: Some(60), ..Default::default() };
        let mut it = ContainerIterator::new(Cursor::new(stream(&[10, 50, 90, 130])), filter);

        assert!(it.has_next().unwrap());
        let mut first = it.next_container().unwrap().unwrap();
        assert_eq!(first.absolute_pos_start, 10);
        assert_eq!(plaintext(&mut first), b"payload-0");

        assert!(it.has_next().unwrap());
        let mut second = it.next_container().unwrap().unwrap();
        assert_eq!(second.absolute_pos_start, 50);
        assert_eq!(plaintext(&mut second), b"payload-1");

        assert!(!it.has_next().unwrap());
        assert!(it.next_container().unwrap().is_none());
        assert!(!it.has_next().unwrap());

        assert_eq!(it.security_filter().inits, vec![0, 1]);
        assert_eq!(it.security_filter().decrypts.get(), 2);
        assert_eq!(it.timings().containers, 2);
    }

    #[test]
    fn has_next_is_idempotent() {
        let mut it = ContainerIterator::new(Cursor::new(stream(&[1, 2])), CountingFilter::default());
        assert!(it.has_next().unwrap());
        assert!(it.has_next().unwrap());
        assert_eq!(it.security_filter().decrypts.get(), 1);
        assert_eq!(it.next_container().unwrap().unwrap().container_id, 0);
        assert_eq!(it.next_container().unwrap().unwrap().container_id, 1);
        assert!(it.next_container().unwrap().is_none());
    }

    #[test]
    fn repeated_raw_access_does_not_decrypt_again() {
        let mut it = ContainerIterator::new(Cursor::new(stream(&[5])), CountingFilter::default());
        let mut c = it.next_container().unwrap().unwrap();
        for _ in 0..3 {
            assert_eq!(plaintext(&mut c), b"payload-0");
        }
        let block = c.sensitive_block().unwrap();
        assert!(block.is_compressed() && block.is_uncompressed());
        assert_eq!(it.security_filter().decrypts.get(), 1);
    }

    #[test]
    fn setup_failure_is_environmental_and_terminal() {
        let filter = CountingFilter { fail_setup: true, ..Default::default() };
        let mut it = ContainerIterator::new(Cursor::new(stream(&[1, 2])), filter);
        let err = it.next_container().unwrap_err();
        assert!(err.is_environmental());
        assert!(matches!(err, IterError::CryptoSetup { container_id: 0, .. }));
        assert!(it.next_container().unwrap().is_none());
        assert_eq!(it.security_filter().decrypts.get(), 0);
    }

    #[test]
    fn missing_sensitive_block_is_reported() {
        let mut buf = Vec::new();
        let mut c = Container::new(4, 0, 1, 0);
        c.add_block(Block::core(vec![1])).unwrap();
        c.write(&mut buf).unwrap();

        let mut it = ContainerIterator::new(Cursor::new(buf), CountingFilter::default());
        let err = it.next().unwrap().unwrap_err();
        assert!(matches!(err, IterError::MissingSensitiveBlock { container_id: 4 }));
        assert!(!err.is_environmental());
        assert!(it.next().is_none());
    }

    #[test]
    fn truncated_stream_is_a_format_error_once() {
        let mut buf = stream(&[1, 2]);
        buf.truncate(buf.len() - 3);
        let mut it = ContainerIterator::new(Cursor::new(buf), CountingFilter::default());
        assert!(it.next().unwrap().is_ok());
        assert!(matches!(it.next(), Some(Err(IterError::Format(_)))));
        assert!(it.next().is_none());
    }

    #[test]
    fn close_discards_buffered_container() {
        let mut it = ContainerIterator::new(Cursor::new(stream(&[1, 2])), CountingFilter::default());
        assert!(it.has_next().unwrap());
        it.close();
        it.close();
        assert!(!it.has_next().unwrap());
        assert!(it.next_container().unwrap().is_none());
        assert_eq!(it.into_filter().inits, vec![0]);
    }
}
