// Hard caps on client-supplied input and per-connection resources.

/// Max bytes in a diner name.
pub const MAX_NAME_LEN: usize = 256;

/// Max bytes in a raw identity string.
pub const MAX_IDENTITY_LEN: usize = 320;

/// Max bytes in a single protocol line.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Max concurrent date watches held by one connection.
pub const MAX_WATCHES_PER_CONNECTION: usize = 32;

/// Max configured slot labels.
pub const MAX_SLOTS: usize = 48;

/// Max configured tables.
pub const MAX_TABLES: usize = 256;
