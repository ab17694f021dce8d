pub mod cache;
pub mod ktfs;

pub use ktfs::{fscreate, fsdelete, fsflush, fsmount, fsopen};
