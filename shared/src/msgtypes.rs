//! Message type numbers understood by the DBSS.

// Router control
pub const CONTROL_ADD_CHANNEL: u16 = 9000;
pub const CONTROL_REMOVE_CHANNEL: u16 = 9001;
pub const CONTROL_ADD_RANGE: u16 = 9002;
pub const CONTROL_REMOVE_RANGE: u16 = 9003;

// State server object messages
pub const STATESERVER_OBJECT_GET_ALL: u16 = 2014;
pub const STATESERVER_OBJECT_GET_ALL_RESP: u16 = 2015;
pub const STATESERVER_OBJECT_DELETE_RAM: u16 = 2032;

// Visibility
pub const STATESERVER_OBJECT_SET_LOCATION: u16 = 2040;
pub const STATESERVER_OBJECT_CHANGING_LOCATION: u16 = 2041;
pub const STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED: u16 = 2042;

// DBSS object messages
pub const DBSS_OBJECT_GET_ACTIVATED: u16 = 2207;
pub const DBSS_OBJECT_GET_ACTIVATED_RESP: u16 = 2208;
pub const DBSS_OBJECT_DELETE_DISK: u16 = 2232;

// Database server
pub const DBSERVER_OBJECT_GET_ALL: u16 = 3014;
pub const DBSERVER_OBJECT_GET_ALL_RESP: u16 = 3015;
pub const DBSERVER_OBJECT_DELETE: u16 = 3032;

/// Status byte values used in database responses.
pub const SUCCESS: u8 = 1;
pub const FAILURE: u8 = 0;
