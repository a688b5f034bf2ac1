use serde::Serialize;

use crate::address::{decode_name, BtAddress, ADDRESS_LEN, NAME_LEN};

/// A remote device seen by an inquiry or stored in the known-device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub address: BtAddress,
    pub name: String,
    /// Class of device.
    pub class: u32,
}

impl DeviceInfo {
    pub fn new(address: BtAddress, name: impl Into<String>, class: u32) -> Self {
        Self {
            address,
            name: name.into(),
            class,
        }
    }

    /// Parse the record carried by `INQUIRY_RESULT` and `LIST_ITEM`.
    ///
    /// ```text
    /// ┌──────────────┬──────────────┬──────────────┐
    /// │ Addr (7B)    │ Name (16B)   │ Class (4B BE)│
    /// └──────────────┴──────────────┴──────────────┘
    /// ```
    pub(crate) fn from_record(params: &[u8]) -> Self {
        let name_end = ADDRESS_LEN + NAME_LEN;
        let name = params.get(ADDRESS_LEN..name_end.min(params.len())).unwrap_or(&[]);
        let class = params
            .get(name_end..name_end + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        Self {
            address: BtAddress::from_wire(params),
            name: decode_name(name),
            class,
        }
    }
}

/// How an inquiry started with `inquire_notify` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InquiryStatus {
    /// The chip finished the inquiry.
    Completed,
    /// `cancel_inquiry` stopped it.
    Terminated,
    /// A reset or a timeout cut it short.
    Error,
}

impl InquiryStatus {
    /// Numeric completion code reported to discovery listeners.
    pub fn code(self) -> i32 {
        match self {
            InquiryStatus::Completed => 0,
            InquiryStatus::Terminated => 5,
            InquiryStatus::Error => 7,
        }
    }
}

/// Receives the results of an asynchronous inquiry.
///
/// Callbacks run on a dedicated notifier thread, one at a time and in
/// discovery order, never on the engine's own threads.
pub trait DiscoveryListener: Send + 'static {
    fn device_discovered(&mut self, device: DeviceInfo);

    fn inquiry_completed(&mut self, status: InquiryStatus);
}
