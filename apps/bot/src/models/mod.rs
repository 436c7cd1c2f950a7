pub mod api;
pub mod event;

pub use api::{ApiResponse, ApiStatus};
pub use event::{Event, MessageEvent, MetaEvent, NoticeEvent, RequestEvent, SourceKey, SourceType};
