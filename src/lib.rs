#[macro_use] extern crate enum_primitive;
#[macro_use] extern crate log;

mod children;
mod error;
mod hi;
mod lowlevel;
mod ondemand;
mod passfd;
mod s11n;
mod server;
mod settings;
mod socket;

pub use children::{AppConfig, ChildManager, Identity};
pub use error::{Error, Result};
pub use hi::connection::{ConnectionId, FastcgiConnection};
pub use hi::request::{InputKind, RequestPhase, RequestState};
pub use hi::service::{FastcgiRequest, FastcgiResponder, FastcgiResponse};
pub use lowlevel::{read_params, read_record, write_params, write_record};
pub use lowlevel::{FastcgiLowlevelCodec, FastcgiRecord, FastcgiRecordBody, BeginRequest, EndRequest};
pub use ondemand::{OnDemandServer, ProcessManager};
pub use passfd::{recv_fd, send_fd, DescriptorChannel};
pub use s11n::{FASTCGI_VERSION, MAX_CONTENT_LEN, NULL_REQUEST_ID, Role, ProtocolStatus, RecordType};
pub use server::{FastcgiServer, ServerConfig};
pub use settings::{FileMode, HostSettings, Setting, SettingSource, SettingValue};
pub use socket::{FastcgiListener, FastcgiStream, ListenAddress, SocketPath};
