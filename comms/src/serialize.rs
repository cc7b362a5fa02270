/// Writes a message body into a frame.
///
/// The body is appended to `buf`. An implementor may also lend a slice of its own memory,
/// which gets written right after `buf` without being copied into it.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
