//! `docrelay status`: daemon status.

use chrono::{DateTime, Local, Utc};
use docrelay_protocol::{Request, Response, StatusInfo};

use crate::error::{ClientError, ClientResult};
use crate::socket::SocketClient;

pub async fn run(client: &SocketClient, json: bool) -> ClientResult<()> {
    let info = match client.request(Request::Status).await? {
        Response::Status { info } => info,
        other => return Err(ClientError::unexpected(&other)),
    };

    if json {
        let out = serde_json::to_string_pretty(&info)
            .map_err(|e| ClientError::UnexpectedResponse(e.to_string()))?;
        println!("{out}");
    } else {
        print!("{}", render(&info));
    }
    Ok(())
}

fn local(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn render(info: &StatusInfo) -> String {
    let uptime = info.uptime_seconds;
    format!(
        "uptime:          {}h{:02}m{:02}s\n\
         authorized:      {}\n\
         token expiry:    {}\n\
         flow:            {:?}\n\
         pending actions: {}\n\
         next trigger:    {}\n\
         last sweep:      {}\n",
        uptime / 3600,
        (uptime % 3600) / 60,
        uptime % 60,
        if info.authenticated { "yes" } else { "no" },
        local(info.token_expiry),
        info.flow_state,
        info.pending_actions,
        local(info.next_trigger),
        local(info.last_sweep),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrelay_protocol::FlowState;

    #[test]
    fn render_status() {
        let info = StatusInfo::new(3725)
            .with_flow_state(FlowState::GrantSurfaceOpen)
            .with_pending(2, None);
        let out = render(&info);
        assert!(out.contains("uptime:          1h02m05s"));
        assert!(out.contains("authorized:      no"));
        assert!(out.contains("flow:            GrantSurfaceOpen"));
        assert!(out.contains("pending actions: 2"));
        assert!(out.contains("next trigger:    -"));
    }
}
