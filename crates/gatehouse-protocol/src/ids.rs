//! Reserved wire message ids.

pub const LOGIN: u32 = 1001;
pub const REGISTER: u32 = 1002;
pub const LOGOUT: u32 = 1003;

pub const QUERY_DATA: u32 = 2001;
pub const UPDATE_DATA: u32 = 2002;

pub const HEARTBEAT: u32 = 3001;

pub const ERROR_RESPONSE: u32 = 9001;
pub const SUCCESS_RESPONSE: u32 = 9002;
