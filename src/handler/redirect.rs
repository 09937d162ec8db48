//! Redirect handler: forwards to the destination the client originally
//! asked for, as recovered by the redirect listener.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::app::metrics::format_bytes;
use crate::common::{Conn, Network, Result, Stream};
use crate::error::Error;
use crate::layer::StatsStream;
use crate::router::Outbound;

use super::{relay, Handler, HandlerOptions};

pub struct RedirectHandler {
    opts: HandlerOptions,
}

impl RedirectHandler {
    pub fn new(opts: HandlerOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    async fn handle(&self, conn: Conn) -> Result<()> {
        let dst = conn.original_dst.clone().ok_or_else(|| {
            Error::Protocol(format!("no original destination for {}", conn.peer))
        })?;

        if let Some(bypass) = &self.opts.bypass {
            if bypass.contains(&dst) {
                debug!(service = %self.opts.service, dst = %dst, "bypass");
                return Ok(());
            }
        }

        let start = Instant::now();
        let outbound = match self.opts.dialer.dial(Network::Tcp, &dst.to_string()).await? {
            Outbound::Stream(s) => s,
            other => {
                return Err(Error::Transport(format!(
                    "redirect: wrong connection type {}",
                    other.kind()
                )))
            }
        };

        let Conn { stream, peer, .. } = conn;
        let stream: Stream = match &self.opts.stats {
            Some(set) => Box::new(StatsStream::new(stream, set.stats(None))),
            None => stream,
        };

        info!(service = %self.opts.service, "{} <-> {}", peer, dst);
        let (up, down) = relay(stream, outbound).await;
        info!(
            service = %self.opts.service,
            "{} >-< {} (↑{} ↓{} {:?})",
            peer,
            dst,
            format_bytes(up),
            format_bytes(down),
            start.elapsed()
        );
        Ok(())
    }
}
