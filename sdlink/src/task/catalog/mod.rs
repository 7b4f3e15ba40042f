//! Concrete tasks.
//!
//! Tasks that produce data expose a [`TaskOutput`](crate::task::TaskOutput)
//! through an accessor; keep a clone before handing the task to the engine.

mod device;
mod files;
mod manage;
mod program;
mod sketch;

pub use device::{
    DeviceInfo, DeviceInfoTask, ReadRegistersTask, ReadSettingsTask, UpdateRegistersTask,
    WriteSettingsTask,
};
pub use files::{ExportFileTask, ExportFolderTask, ImportFileTask, ImportFolderTask, ListDirectoryTask};
pub use manage::{DeleteTask, RenameTask, RenameVolumeTask};
pub use program::{UploadFirmwareTask, UploadProgramTask};
pub use sketch::{
    ICON_EXTENSION, LaunchSketchTask, ListSketchesTask, LoadIconTask, SKETCH_EXTENSION, SketchInfo,
};
