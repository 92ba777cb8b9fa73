//! The bouncer service: commands sent as PRIVMSG to the reserved nick.

use tracing::info;

use crate::user::User;
use crate::SERVICE_NICK;

fn reply(user: &User, dc_idx: usize, text: &str) {
    let dc = &user.downstreams[dc_idx];
    dc.send_service_notice(&user.shared.hostname, text);
}

/// Handle one service command line from a downstream.
pub async fn handle_message(user: &mut User, dc_idx: usize, text: &str) {
    let words: Vec<&str> = text.split_whitespace().collect();
    info!(command = %text, "service command");

    match words.as_slice() {
        ["help"] | [] => {
            reply(user, dc_idx, "available commands:");
            reply(user, dc_idx, "  help: print this message");
            reply(user, dc_idx, "  network list: show saved networks and their status");
        }
        ["network", "list"] | ["network", "status"] => {
            if user.networks.is_empty() {
                reply(user, dc_idx, "no networks configured");
                return;
            }
            let mut lines = Vec::new();
            for net in &user.networks {
                let state = match (&net.conn, &net.last_error) {
                    (Some(_), _) => "connected".to_owned(),
                    (None, Some(err)) => format!("disconnected: {}", err),
                    (None, None) => "disconnected".to_owned(),
                };
                lines.push(format!(
                    "{} (id {}, {}): {}",
                    net.record.get_name(),
                    net.record.id,
                    net.record.addr,
                    state
                ));
            }
            for line in lines {
                reply(user, dc_idx, &line);
            }
        }
        _ => {
            reply(
                user,
                dc_idx,
                &format!(
                    "unknown command {:?}; send \"help\" to {} for usage",
                    words.first().copied().unwrap_or(""),
                    SERVICE_NICK
                ),
            );
        }
    }
}
