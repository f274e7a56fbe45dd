/// The error type, mirroring `wardenframe`'s own `Error` enum.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    InvalidArgs,
    NoMemory,
    PageFault,
    AccessDenied,
    IoError,
    InvalidVmpermBits,
    NotEnoughResources,
    NoChild,
}
