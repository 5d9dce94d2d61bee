/// PRODID stamped into every VCALENDAR this tool writes
pub const PRODID: &str = "-//calbridge//calbridge 0.1//EN";

/// CalDAV discovery entry point; the adapter rebinds to the
/// server-specific base URL after principal discovery
pub const CALDAV_DISCOVERY_URL: &str = "https://caldav.icloud.com";

/// Google Calendar API base URL
pub const GOOGLE_API_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Page size for Google event listings
pub const GOOGLE_PAGE_SIZE: u32 = 250;

/// Page size when consuming a sync token (deltas are cheap to page)
pub const GOOGLE_SYNC_PAGE_SIZE: u32 = 2500;

/// File holding outstanding webhook channel descriptors
pub const PUSH_CHANNELS_FILE: &str = "push_channels.json";
