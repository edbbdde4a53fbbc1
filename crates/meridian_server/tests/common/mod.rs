#![allow(dead_code)]

pub use std::sync::Arc;

pub use meridian_server::router::handle_command;
pub use meridian_server::{Message, Server};

pub fn setup() -> Arc<Server> {
    Server::ephemeral()
}

/// Run one command and return the flattened reply, the way the wire test
/// harness renders it: scalars bare, arrays as `[a b c]`, null as `nil`.
pub fn do_cmd(server: &Arc<Server>, args: &[&str]) -> String {
    let mut msg = Message::from_args(args);
    handle_command(server, &mut msg).flat()
}

/// Run a batch of `(command, expected)` pairs, failing on the first
/// mismatch.
pub fn do_batch(server: &Arc<Server>, steps: &[(&[&str], &str)]) {
    for (i, (args, expected)) in steps.iter().enumerate() {
        let got = do_cmd(server, args);
        assert_eq!(
            &got, expected,
            "step {} ({:?}) replied '{}', want '{}'",
            i, args, got, expected
        );
    }
}
