use std::io;

/// Element types a receive buffer may be built from. Their alignment is at least 4 bytes,
/// so `f32` and `f16` tensors carried in a frame can be viewed without copying.
pub trait Align4: bytemuck::Pod {}

macro_rules! align4 {
    ($($t:ty),*) => { $(impl Align4 for $t {})* };
}

align4!(u32, i32, u64, i64, u128, i128, f32, f64);

/// Encodes a value into a frame body.
pub trait Serialize<'a> {
    /// Appends the header part of `self` to `buf` and hands back the borrowed tail that the
    /// sender writes right after it, when there is one.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}

/// Decodes a frame body, possibly borrowing from it.
pub trait Deserialize<'a>: Sized {
    fn deserialize(frame: &'a [u8]) -> io::Result<Self>;
}
