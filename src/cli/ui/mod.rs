mod device_view;
mod event_view;
mod painter;
mod scanner_view;
mod table;

pub(crate) use self::device_view::DeviceInfoView;
pub(crate) use self::event_view::SessionEventView;
pub(crate) use self::painter::Painter;
pub(crate) use self::scanner_view::ScannerListView;
