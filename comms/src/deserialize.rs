use std::io;

/// Parses a received frame body, the result may borrow from the body and mutate it in place.
pub trait Deserialize<'a>: Sized {
    fn deserialize(body: &'a mut [u8]) -> io::Result<Self>;
}
