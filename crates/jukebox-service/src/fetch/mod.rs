//! Materializing keys into files.
//!
//! The actual download is a black box behind the [`Fetcher`] trait. The service calls it at most
//! once per key at a time, and only ever with a private staging location to write to.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::FetchResult;
use crate::types::FetchKey;

mod command;

pub use command::CommandFetcher;

/// The inputs of one fetch.
#[derive(Clone, Copy, Debug)]
pub struct FetchRequest<'a> {
    pub key: &'a FetchKey,
    /// An output path template of the form `{staging}/{key}.%(ext)s`.
    pub output_template: &'a Path,
    /// Where the result is expected once the fetch succeeded.
    pub output_path: &'a Path,
    /// Cancelled when the service shuts down.
    pub cancel: &'a CancellationToken,
}

pub trait Fetcher: Send + Sync + 'static {
    /// Produces a non-empty file for `request.key` and returns its path.
    ///
    /// Any failure, including a missing or empty output file, is reported as an error.
    fn fetch<'a>(&'a self, request: FetchRequest<'a>) -> BoxFuture<'a, FetchResult<PathBuf>>;
}

/// Replaces `{name}` placeholders in `template` in a single pass.
///
/// Values are inserted verbatim and never expanded again. Unknown placeholders are kept as
/// they are.
pub(crate) fn expand_placeholders(template: &str, vars: &[(&str, &str)]) -> String {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        expanded.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let replacement = candidate.find('}').and_then(|end| {
            let name = &candidate[1..end];
            vars.iter()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| (*value, end + 1))
        });
        match replacement {
            Some((value, consumed)) => {
                expanded.push_str(value);
                rest = &candidate[consumed..];
            }
            None => {
                expanded.push('{');
                rest = &candidate[1..];
            }
        }
    }

    expanded.push_str(rest);
    expanded
}
