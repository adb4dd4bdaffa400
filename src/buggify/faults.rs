//! Named fault-injection points.

pub mod object_store {
    pub const PUT_FAIL: &str = "object_store.put_fail";
    pub const GET_FAIL: &str = "object_store.get_fail";
    pub const LIST_FAIL: &str = "object_store.list_fail";
    pub const DELETE_FAIL: &str = "object_store.delete_fail";
    pub const TIMEOUT: &str = "object_store.timeout";
    /// Write lands but the acknowledgement is lost
    pub const LOST_ACK: &str = "object_store.lost_ack";
}

pub const ALL_FAULTS: &[&str] = &[
    object_store::PUT_FAIL,
    object_store::GET_FAIL,
    object_store::LIST_FAIL,
    object_store::DELETE_FAIL,
    object_store::TIMEOUT,
    object_store::LOST_ACK,
];
