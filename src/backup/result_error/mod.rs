use std::fmt::Debug;
pub mod error;
pub mod result;

pub trait WithDebugObjectAndFnName<S: Into<String>, O: Debug + 'static> {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self;
}

pub trait WithMsg<S: Into<String>> {
    fn with_msg(self, msg: S) -> Self;
}

/// Coarse classification of a failed run. Every kind is fatal for the run that hit it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad source/target, invalid retention count, unparsable config or exclude pattern.
    Configuration,
    /// The sync subprocess exited unsuccessfully.
    Sync,
    /// Clone, rename, delete or metadata I/O failed.
    Filesystem,
    /// Another run holds the target's lock.
    Locked,
}
