// RPC method names accepted on `POST /rpc`.

// tasks
pub const TASK_INIT: &str = "task.init";
pub const TASK_EXECUTE: &str = "task.execute";
pub const TASK_STATUS: &str = "task.status";
pub const TASK_WAIT: &str = "task.wait";
pub const TASK_AWAIT: &str = "task.await";
pub const TASK_ABORT: &str = "task.abort";

// liveness
pub const PING: &str = "ping";
