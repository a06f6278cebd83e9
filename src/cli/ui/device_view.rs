use std::fmt::{self, Display, Formatter};

use url::Url;

use crate::protocol::DeviceInfo;

use super::painter::Painter;
use super::table::Table;

/// Renders a scanner's infoex description as a key-value table.
pub(crate) struct DeviceInfoView<'a> {
    url: &'a Url,
    info: &'a DeviceInfo,
    painter: &'a Painter,
}

impl<'a> DeviceInfoView<'a> {
    pub(crate) fn new(url: &'a Url, info: &'a DeviceInfo, painter: &'a Painter) -> Self {
        Self { url, info, painter }
    }

    fn optional(&self, value: Option<&str>) -> String {
        match value {
            Some(value) => self.painter.value(value),
            None => self.painter.muted("<unknown>"),
        }
    }
}

impl Display for DeviceInfoView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let table = Table::key_value(
            self.painter,
            vec![
                ("url", self.painter.value(self.url.as_str())),
                ("manufacturer", self.optional(self.info.manufacturer())),
                ("model", self.optional(self.info.model())),
                ("version", self.optional(self.info.version())),
                ("api", self.painter.value(self.info.api_path())),
            ],
        );
        write!(f, "{}", self.painter.heading("Scanner:"))?;
        write!(f, "\n{table}")
    }
}
