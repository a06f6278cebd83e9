use std::fmt::{self, Display, Formatter};

use crate::cloud::connection::CloudScannerInfo;

use super::painter::Painter;
use super::table::Table;

/// Renders the scanners registered with a cloud account.
pub(crate) struct ScannerListView<'a> {
    scanners: &'a [CloudScannerInfo],
    painter: &'a Painter,
}

impl<'a> ScannerListView<'a> {
    pub(crate) fn new(scanners: &'a [CloudScannerInfo], painter: &'a Painter) -> Self {
        Self { scanners, painter }
    }
}

impl Display for ScannerListView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.painter.heading("Cloud scanners:"))?;
        if self.scanners.is_empty() {
            return write!(f, "\n{}", self.painter.muted("no scanners registered"));
        }
        let rows = self
            .scanners
            .iter()
            .map(|scanner| {
                vec![
                    self.painter.value(&scanner.id),
                    scanner.name.clone(),
                    scanner.description.clone(),
                    self.painter.muted(scanner.url.as_str()),
                ]
            })
            .collect();
        let table = Table::grid(["id", "name", "description", "url"], rows);
        write!(f, "\n{table}")
    }
}
