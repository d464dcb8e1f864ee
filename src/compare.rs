use std::cmp::Ordering;

/// Key comparison for the command-line sort
///
/// Keys compare as signed integers; `-r` reverses the order. Lines with
/// equal keys have no defined relative order.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyOrder {
    pub reverse: bool,
}

impl KeyOrder {
    pub fn new(reverse: bool) -> Self {
        Self { reverse }
    }

    pub fn compare(&self, a: &i64, b: &i64) -> Ordering {
        maybe_reverse(a.cmp(b), self.reverse)
    }
}

/// Apply reverse if needed
#[inline]
fn maybe_reverse(ord: Ordering, reverse: bool) -> Ordering {
    if reverse { ord.reverse() } else { ord }
}
