/// Split `items` into ordered, contiguous batches of at most `size`.
///
/// `None` or `Some(0)` yields a single batch; empty input yields none.
pub fn batches<T>(items: &[T], size: Option<usize>) -> Vec<&[T]> {
    if items.is_empty() {
        return Vec::new();
    }
    match size {
        Some(size) if size > 0 => items.chunks(size).collect(),
        _ => vec![items],
    }
}
