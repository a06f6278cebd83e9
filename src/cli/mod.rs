pub(crate) mod command;
pub(crate) mod info;
pub(crate) mod scan;
pub(crate) mod scanners;
pub(crate) mod ui;

pub use self::command::{Args, Command, FakeArgs, InfoArgs, LogLevel, ScanArgs, ScannersArgs};
