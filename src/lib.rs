//! Client engine for TWAIN Direct scanners, reached over the local network
//! or relayed through a TWAIN Cloud service.

mod app;
mod blocks;
mod cli;
mod cloud;
mod error;
mod notification;
mod protocol;
mod session;
mod telemetry;
mod terminal;
mod transport;
mod uri;

pub use app::{
    fake_http_client, real_http_client, run, run_with_clients, run_with_clients_and_log_level,
    run_with_log_level,
};
pub use blocks::multipart::{self, BlockBody, MultipartPart};
pub use cli::{Args, Command, FakeArgs, InfoArgs, LogLevel, ScanArgs, ScannersArgs};
pub use cloud::broker::{EventBroker, PendingDelivery};
pub use cloud::connection::{CloudConnection, CloudScannerInfo};
pub use cloud::pubsub::{
    ChannelPubSub, PubSubClient, PubSubEvent, PubSubPublisher, PubSubSubscription,
};
pub use error::{ConnectionError, DecodeError, SessionError, TransportError, TwainError};
pub use notification::{ReceivedImage, SessionEvent, SessionEvents};
pub use protocol::{
    ARRAY_KEY, BlockMetadata, CommandEnvelope, CommandId, CommandMethod, DeviceInfo,
    EventBrokerInfo, MoreParts, SessionState, SessionStatus, StatusDetected,
};
pub use session::{Session, SessionConfig, default_download_dir, discover_device};
pub use terminal::{SystemTerminalClient, TerminalClient};
pub use transport::command::{BlockResponse, CommandTransport, TransportMode};
pub use transport::fake_scanner::{
    FAKE_CLOUD_API_ROOT, FAKE_CLOUD_SCANNER_ID, FAKE_SCANNER_URL, FakeCloudRelay, FakeScanner,
};
pub use transport::http::{
    HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
};
pub use uri::append_path;
