use chrono::{Local, Utc};

/// Format used inside quarantine and disposition file names.
pub const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Wall-clock stamp for file names, in local time so it reads naturally next to file managers.
pub fn file_stamp() -> String {
    Local::now().format(FILE_STAMP_FORMAT).to_string()
}
