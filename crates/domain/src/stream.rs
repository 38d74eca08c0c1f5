use std::pin::Pin;

use crate::error::Result;

/// A boxed async stream, used for token streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// A stream of raw text chunks from a model backend.
///
/// Chunks may be true deltas or cumulative restatements of everything
/// produced so far; consumers must not assume either.
pub type TokenStream = BoxStream<'static, Result<String>>;
