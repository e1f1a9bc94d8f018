pub mod action;
pub mod backup_config;
pub mod clock;
pub mod hardlink;
pub mod lock;
pub mod metadata;
pub mod processor;
pub mod result_error;
pub mod retention;
pub mod snapshot;
pub mod sync;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
