pub mod http_rpc;
pub mod sibling_server;
