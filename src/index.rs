//! Index algebra for slice requests.
//!
//! Every flow node exposes a pull interface addressed by an [`Request`]: a
//! mapping from dimension names to selectors, an ordered tuple of selectors,
//! or the metadata-only probe. Selectors follow the usual slice conventions
//! (negative indices count from the end, out-of-range slice bounds are
//! clipped). Before any data access, selectors are normalized against a known
//! dimension size into [`NormSelector`] values on which composition and shape
//! computation are exact.
//!
//! [`Request`]: enum.Request.html
//! [`NormSelector`]: enum.NormSelector.html

use std::collections::BTreeMap;
use std::fmt;

/// A single per-dimension selector as it appears in definitions and chunk
/// tables.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Selector {
    /// A single integer index. Reduces the dimension away.
    Int(i64),
    /// A range with optional start, stop and step.
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    /// The full-axis marker, equivalent to `::`.
    Full,
}

impl Selector {
    pub fn slice(start: i64, stop: i64) -> Self {
        Selector::Slice {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt(value: &Option<i64>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }

        match self {
            Selector::Int(index) => write!(f, "{}", index),
            Selector::Slice { start, stop, step } => match step {
                Some(step) => write!(f, "{}:{}:{}", opt(start), opt(stop), step),
                None => write!(f, "{}:{}", opt(start), opt(stop)),
            },
            Selector::Full => write!(f, ":"),
        }
    }
}

/// A selector normalized against a concrete dimension size. All positions are
/// in-bounds; `Range` enumerates `start`, `start + step`, ... (`len` items).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NormSelector {
    Index(usize),
    Range { start: usize, len: usize, step: isize },
}

impl NormSelector {
    pub fn full(size: usize) -> Self {
        NormSelector::Range {
            start: 0,
            len: size,
            step: 1,
        }
    }

    /// Length of the selection along its dimension; `None` for an integer
    /// index which reduces the dimension away.
    pub fn len(&self) -> Option<usize> {
        match self {
            NormSelector::Index(_) => None,
            NormSelector::Range { len, .. } => Some(*len),
        }
    }

    /// The position of the `at`-th selected element in the underlying space.
    pub fn position(&self, at: usize) -> usize {
        match self {
            NormSelector::Index(index) => *index,
            NormSelector::Range { start, step, len } => {
                debug_assert!(at < *len);
                (*start as isize + (at as isize) * step) as usize
            }
        }
    }

    /// Mirror of this selection in a dimension of `size` elements. Used by
    /// the writer to turn write chunks into read chunks on inverted axes.
    pub fn mirrored(&self, size: usize) -> Self {
        match *self {
            NormSelector::Index(index) => NormSelector::Index(size - index - 1),
            NormSelector::Range { start, len, step } => NormSelector::Range {
                start: size - start - 1,
                len,
                step: -step,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum IndexError {
    OutOfBounds { index: i64, size: usize },
    ZeroStep,
    RankMismatch { expected: usize, found: usize },
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::OutOfBounds { index, size } => {
                write!(f, "index {} out of bounds for size {}", index, size)
            }
            IndexError::ZeroStep => write!(f, "slice step must be non-zero"),
            IndexError::RankMismatch { expected, found } => write!(
                f,
                "selector tuple of length {} applied to {} dimensions",
                found, expected
            ),
        }
    }
}

fn resolve_endpoint(value: i64, size: usize) -> i64 {
    if value < 0 {
        value + size as i64
    } else {
        value
    }
}

/// Normalizes a selector against a dimension of `size` elements. Slice bounds
/// are clipped, integer indices must be in range.
pub fn normalize(selector: &Selector, size: usize) -> Result<NormSelector, IndexError> {
    match *selector {
        Selector::Full => Ok(NormSelector::full(size)),
        Selector::Int(index) => {
            let resolved = resolve_endpoint(index, size);
            if resolved < 0 || resolved >= size as i64 {
                Err(IndexError::OutOfBounds { index, size })
            } else {
                Ok(NormSelector::Index(resolved as usize))
            }
        }
        Selector::Slice { start, stop, step } => {
            let step = step.unwrap_or(1);
            if step == 0 {
                return Err(IndexError::ZeroStep);
            }

            let size = size as i64;
            let (start, stop) = if step > 0 {
                let start = start.map(|s| resolve_endpoint(s, size as usize)).unwrap_or(0);
                let stop = stop.map(|s| resolve_endpoint(s, size as usize)).unwrap_or(size);
                (start.max(0).min(size), stop.max(0).min(size))
            } else {
                let start = start
                    .map(|s| resolve_endpoint(s, size as usize))
                    .unwrap_or(size - 1);
                let stop = stop.map(|s| resolve_endpoint(s, size as usize)).unwrap_or(-1);
                (start.max(-1).min(size - 1), stop.max(-1).min(size - 1))
            };

            let len = if step > 0 {
                (stop - start + step - 1).div_euclid(step).max(0)
            } else {
                (stop - start + step + 1).div_euclid(step).max(0)
            };

            Ok(NormSelector::Range {
                // An empty range may have a nonsensical start; pin it to zero
                // so downstream arithmetic stays in bounds.
                start: if len == 0 { 0 } else { start as usize },
                len: len as usize,
                step: step as isize,
            })
        }
    }
}

/// An index request as passed between flow nodes.
#[derive(Clone, PartialEq, Debug)]
pub enum Request {
    /// Selectors keyed by dimension name. Unnamed dimensions get the full
    /// axis.
    Named(BTreeMap<String, Selector>),
    /// Selectors aligned positionally to the node's output dimensions.
    /// Missing trailing entries get the full axis.
    Ordered(Vec<Selector>),
    /// Metadata-only request: units, dimensions and name without data.
    Probe,
}

impl Request {
    pub fn full() -> Self {
        Request::Ordered(Vec::new())
    }

    pub fn is_probe(&self) -> bool {
        matches!(self, Request::Probe)
    }

    /// Aligns the request to an ordered dimension list, one selector per
    /// dimension. Returns `None` for a probe. Named selectors for dimensions
    /// the node does not have are simply not its concern and are ignored.
    pub fn align(&self, dims: &[String]) -> Result<Option<Vec<Selector>>, IndexError> {
        match self {
            Request::Probe => Ok(None),
            Request::Named(map) => Ok(Some(
                dims.iter()
                    .map(|dim| map.get(dim).copied().unwrap_or(Selector::Full))
                    .collect(),
            )),
            Request::Ordered(selectors) => {
                if selectors.len() > dims.len() {
                    return Err(IndexError::RankMismatch {
                        expected: dims.len(),
                        found: selectors.len(),
                    });
                }
                let mut aligned = selectors.clone();
                aligned.resize(dims.len(), Selector::Full);
                Ok(Some(aligned))
            }
        }
    }

    /// Restricts a named request to the given dimensions, dropping selectors
    /// for dimensions the target does not have.
    pub fn project(&self, dims: &[String]) -> Request {
        match self {
            Request::Named(map) => Request::Named(
                map.iter()
                    .filter(|(name, _)| dims.iter().any(|dim| &dim == name))
                    .map(|(name, selector)| (name.clone(), *selector))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Composes a request-time selection (`outer`, addressed in the window space)
/// with a construction-time selection (`inner`, addressed in the source
/// space). Integer selectors in `inner` consume no outer slot since the
/// corresponding dimension is no longer visible to the caller.
pub fn compose(outer: &[NormSelector], inner: &[NormSelector]) -> Vec<NormSelector> {
    let mut composed = Vec::with_capacity(inner.len());
    let mut outer_iter = outer.iter();

    for inner_sel in inner {
        match *inner_sel {
            NormSelector::Index(index) => composed.push(NormSelector::Index(index)),
            NormSelector::Range { start, step, len } => {
                let outer_sel = outer_iter.next().copied().unwrap_or_else(|| {
                    NormSelector::full(len)
                });
                composed.push(match outer_sel {
                    NormSelector::Index(at) => {
                        NormSelector::Index((start as isize + at as isize * step) as usize)
                    }
                    NormSelector::Range {
                        start: o_start,
                        len: o_len,
                        step: o_step,
                    } => NormSelector::Range {
                        start: (start as isize + o_start as isize * step) as usize,
                        len: o_len,
                        step: step * o_step,
                    },
                });
            }
        }
    }

    composed
}

/// The shape remaining after applying the given selection.
pub fn selection_shape(selection: &[NormSelector]) -> Vec<usize> {
    selection.iter().filter_map(NormSelector::len).collect()
}
