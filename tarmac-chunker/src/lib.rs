//! API for splitting byte streams into chunks at content-defined positions
//! in a keyed, repeatable manner.
//!
//! Chunkers must meet three properties:
//! 1.) Data must be split into one or more chunks
//! 2.) Data must be identical to the original after simple reconstruction
//!     by concatenation
//! 3.) The same data and parameters must produce the same chunks every
//!     time, regardless of how the input is fed in
//!
//! The split positions are derived from key material, so an observer of
//! chunk sizes learns nothing about where a particular byte pattern forces
//! a boundary.

pub mod params;
pub mod polynomial;

pub use self::params::ChunkerParams;
pub use self::polynomial::{Chunkifier, Polynomial};

use std::io;
use std::io::{Cursor, Read};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("provider IO error")]
    IoError(#[from] io::Error),
    #[error("mean length must be at most 1262226 and below the maximum")]
    BadParameters,
    #[error("chunker applied to empty data")]
    Empty,
}

/// Describes something that can slice a stream in a defined, repeatable
/// manner.
///
/// Chunkers carry only settings and are cheap to clone; the returned
/// iterator owns the reader and the chunking state.
pub trait Chunker: Clone {
    type Chunks: Iterator<Item = Result<Vec<u8>, ChunkerError>>;
    /// Core function, takes a boxed owned `Read` and produces an iterator
    /// of chunks over it.
    fn chunk_boxed(&self, read: Box<dyn Read + 'static>) -> Self::Chunks;
    /// Convenience function that boxes a bare `Read` and passes it to
    /// `chunk_boxed`.
    fn chunk<R: Read + 'static>(&self, read: R) -> Self::Chunks {
        let boxed: Box<dyn Read + 'static> = Box::new(read);
        self.chunk_boxed(boxed)
    }
    /// Convenience function for in-memory input.
    fn chunk_slice<R: AsRef<[u8]> + 'static>(&self, slice: R) -> Self::Chunks {
        let cursor = Cursor::new(slice);
        let boxed: Box<dyn Read + 'static> = Box::new(cursor);
        self.chunk_boxed(boxed)
    }
}
