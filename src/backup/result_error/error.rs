use crate::backup::result_error::{ErrorKind, WithDebugObjectAndFnName, WithMsg};
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    StripPrefix(#[from] std::path::StripPrefixError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    Glob(#[from] globset::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Sync command `{command}` failed with {status}")]
    SyncFailed { command: String, status: ExitStatus },
    #[error("Target is locked by another run: {0:?}")]
    Locked(PathBuf),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl Error {
    pub fn configuration<S: Into<String>>(msg: S) -> Error {
        Error::Configuration(msg.into())
    }

    /// Classifies the error, looking through context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::WalkDir(_) | Error::StripPrefix(_) | Error::SerdeJson(_) => {
                ErrorKind::Filesystem
            }
            Error::SerdeYml(_)
            | Error::Glob(_)
            | Error::ValidationError(_)
            | Error::Configuration(_) => ErrorKind::Configuration,
            Error::SyncFailed { .. } => ErrorKind::Sync,
            Error::Locked(_) => ErrorKind::Locked,
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.kind()
            }
        }
    }
}
