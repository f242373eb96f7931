/// Reverse the byte order of every `width`-byte word in `buf`, in place.
///
/// A trailing partial word is left untouched. Widths of 0 or 1 are no-ops.
pub fn swap_words(buf: &mut [u8], width: usize) {
    if width < 2 {
        return;
    }
    for word in buf.chunks_exact_mut(width) {
        word.reverse();
    }
}
