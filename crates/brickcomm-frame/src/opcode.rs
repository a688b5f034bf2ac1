//! BC4 message opcodes.
//!
//! Commands flow from the brick to the chip; results, acknowledgements and
//! notifications flow back. Some notifications (connection requests, PIN
//! requests, reset indications) arrive unsolicited.

pub const BEGIN_INQUIRY: u8 = 0;
pub const CANCEL_INQUIRY: u8 = 1;
pub const CONNECT: u8 = 2;
pub const OPEN_PORT: u8 = 3;
pub const LOOKUP_NAME: u8 = 4;
pub const ADD_DEVICE: u8 = 5;
pub const REMOVE_DEVICE: u8 = 6;
pub const DUMP_LIST: u8 = 7;
pub const CLOSE_CONNECTION: u8 = 8;
pub const ACCEPT_CONNECTION: u8 = 9;
pub const PIN_CODE: u8 = 10;
pub const OPEN_STREAM: u8 = 11;
pub const START_HEART: u8 = 12;
pub const HEARTBEAT: u8 = 13;
pub const INQUIRY_RUNNING: u8 = 14;
pub const INQUIRY_RESULT: u8 = 15;
pub const INQUIRY_STOPPED: u8 = 16;
pub const LOOKUP_NAME_RESULT: u8 = 17;
pub const LOOKUP_NAME_FAILURE: u8 = 18;
pub const CONNECT_RESULT: u8 = 19;
pub const RESET_INDICATION: u8 = 20;
pub const REQUEST_PIN_CODE: u8 = 21;
pub const REQUEST_CONNECTION: u8 = 22;
pub const LIST_RESULT: u8 = 23;
pub const LIST_ITEM: u8 = 24;
pub const LIST_DUMP_STOPPED: u8 = 25;
pub const CLOSE_CONNECTION_RESULT: u8 = 26;
pub const PORT_OPEN_RESULT: u8 = 27;
pub const SET_DISCOVERABLE: u8 = 28;
pub const CLOSE_PORT: u8 = 29;
pub const CLOSE_PORT_RESULT: u8 = 30;
pub const PIN_CODE_ACK: u8 = 31;
pub const SET_DISCOVERABLE_ACK: u8 = 32;
pub const SET_FRIENDLY_NAME: u8 = 33;
pub const SET_FRIENDLY_NAME_ACK: u8 = 34;
pub const GET_LINK_QUALITY: u8 = 35;
pub const LINK_QUALITY_RESULT: u8 = 36;
pub const SET_FACTORY_SETTINGS: u8 = 37;
pub const SET_FACTORY_SETTINGS_ACK: u8 = 38;
pub const GET_LOCAL_ADDR: u8 = 39;
pub const GET_LOCAL_ADDR_RESULT: u8 = 40;
pub const GET_FRIENDLY_NAME: u8 = 41;
pub const GET_DISCOVERABLE: u8 = 42;
pub const GET_PORT_OPEN: u8 = 43;
pub const GET_FRIENDLY_NAME_RESULT: u8 = 44;
pub const GET_DISCOVERABLE_RESULT: u8 = 45;
pub const GET_PORT_OPEN_RESULT: u8 = 46;
pub const GET_VERSION: u8 = 47;
pub const GET_VERSION_RESULT: u8 = 48;
pub const GET_BRICK_STATUSBYTE_RESULT: u8 = 49;
pub const SET_BRICK_STATUSBYTE_RESULT: u8 = 50;
pub const GET_BRICK_STATUSBYTE: u8 = 51;
pub const SET_BRICK_STATUSBYTE: u8 = 52;
pub const GET_OPERATING_MODE: u8 = 53;
pub const SET_OPERATING_MODE: u8 = 54;
pub const OPERATING_MODE_RESULT: u8 = 55;
pub const GET_CONNECTION_STATUS: u8 = 56;
pub const CONNECTION_STATUS_RESULT: u8 = 57;
pub const GOTO_DFU_MODE: u8 = 58;

/// Highest opcode the chip defines.
pub const LAST: u8 = GOTO_DFU_MODE;

/// Returns a human-readable name for an opcode.
pub fn opcode_name(op: u8) -> &'static str {
    const NAMES: [&str; LAST as usize + 1] = [
        "BEGIN_INQUIRY",
        "CANCEL_INQUIRY",
        "CONNECT",
        "OPEN_PORT",
        "LOOKUP_NAME",
        "ADD_DEVICE",
        "REMOVE_DEVICE",
        "DUMP_LIST",
        "CLOSE_CONNECTION",
        "ACCEPT_CONNECTION",
        "PIN_CODE",
        "OPEN_STREAM",
        "START_HEART",
        "HEARTBEAT",
        "INQUIRY_RUNNING",
        "INQUIRY_RESULT",
        "INQUIRY_STOPPED",
        "LOOKUP_NAME_RESULT",
        "LOOKUP_NAME_FAILURE",
        "CONNECT_RESULT",
        "RESET_INDICATION",
        "REQUEST_PIN_CODE",
        "REQUEST_CONNECTION",
        "LIST_RESULT",
        "LIST_ITEM",
        "LIST_DUMP_STOPPED",
        "CLOSE_CONNECTION_RESULT",
        "PORT_OPEN_RESULT",
        "SET_DISCOVERABLE",
        "CLOSE_PORT",
        "CLOSE_PORT_RESULT",
        "PIN_CODE_ACK",
        "SET_DISCOVERABLE_ACK",
        "SET_FRIENDLY_NAME",
        "SET_FRIENDLY_NAME_ACK",
        "GET_LINK_QUALITY",
        "LINK_QUALITY_RESULT",
        "SET_FACTORY_SETTINGS",
        "SET_FACTORY_SETTINGS_ACK",
        "GET_LOCAL_ADDR",
        "GET_LOCAL_ADDR_RESULT",
        "GET_FRIENDLY_NAME",
        "GET_DISCOVERABLE",
        "GET_PORT_OPEN",
        "GET_FRIENDLY_NAME_RESULT",
        "GET_DISCOVERABLE_RESULT",
        "GET_PORT_OPEN_RESULT",
        "GET_VERSION",
        "GET_VERSION_RESULT",
        "GET_BRICK_STATUSBYTE_RESULT",
        "SET_BRICK_STATUSBYTE_RESULT",
        "GET_BRICK_STATUSBYTE",
        "SET_BRICK_STATUSBYTE",
        "GET_OPERATING_MODE",
        "SET_OPERATING_MODE",
        "OPERATING_MODE_RESULT",
        "GET_CONNECTION_STATUS",
        "CONNECTION_STATUS_RESULT",
        "GOTO_DFU_MODE",
    ];
    NAMES.get(op as usize).copied().unwrap_or("UNKNOWN")
}

/// Returns true for notifications the chip may send without being asked.
pub fn is_unsolicited(op: u8) -> bool {
    matches!(
        op,
        RESET_INDICATION | REQUEST_PIN_CODE | REQUEST_CONNECTION | PIN_CODE_ACK | CLOSE_CONNECTION_RESULT
    )
}
