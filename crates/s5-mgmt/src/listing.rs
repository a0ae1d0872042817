//! Owned listing snapshots.

use crate::error::{MgmtError, Result};

/// Copies `items` into a freshly reserved vector, reporting allocation failure.
pub(crate) fn materialize<T, I>(what: &str, items: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: ExactSizeIterator,
{
    let items = items.into_iter();
    let len = items.len();
    let mut out = Vec::new();
    out.try_reserve_exact(len)
        .map_err(|e| MgmtError::OutOfMemory(format!("{what} listing of {len} entries: {e}")))?;
    out.extend(items);
    Ok(out)
}
