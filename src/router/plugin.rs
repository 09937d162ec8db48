//! Router plugins: route lookup delegated to an external service
//!
//! Two transports, chosen by the `type` of the plugin config:
//! - gRPC: unary `/proto.Router/GetRoute`
//! - HTTP: `POST` of `{"dst": ...}` answered by `{"net": ..., "gateway": ...}`
//!
//! A failed call is logged and resolves to no route.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use serde::{Deserialize, Serialize};
use tonic::codec::ProstCodec;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{error, warn};

use crate::common::Result;
use crate::error::Error;

use super::{parse_route, Route, RouteResolver};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const GET_ROUTE_PATH: &str = "/proto.Router/GetRoute";

/// Connection settings shared by both plugin transports.
#[derive(Debug, Clone)]
pub struct PluginOptions {
    /// Sent as `token` metadata (gRPC) or a bearer token (HTTP)
    pub token: Option<String>,
    /// Enable TLS towards the plugin
    pub tls: bool,
    /// Name to verify the plugin certificate against
    pub server_name: Option<String>,
    /// Verify the plugin certificate
    pub secure: bool,
    pub timeout: Duration,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            token: None,
            tls: false,
            server_name: None,
            secure: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Build the plugin for `kind`: `http`, anything else is gRPC.
pub fn new_plugin(
    name: &str,
    kind: &str,
    addr: &str,
    opts: PluginOptions,
) -> Result<Arc<dyn RouteResolver>> {
    match kind {
        "http" => Ok(Arc::new(HttpPlugin::new(name, addr, opts)?)),
        _ => Ok(Arc::new(GrpcPlugin::new(name, addr, opts))),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
struct GetRouteRequest {
    #[prost(string, tag = "1")]
    dst: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct GetRouteReply {
    #[prost(string, tag = "1")]
    net: String,
    #[prost(string, tag = "2")]
    gateway: String,
}

/// Route lookup over gRPC.
pub struct GrpcPlugin {
    name: String,
    channel: Option<Channel>,
    token: Option<AsciiMetadataValue>,
}

impl GrpcPlugin {
    /// Never fails: a plugin that cannot be set up logs the error and
    /// resolves nothing.
    pub fn new(name: &str, addr: &str, opts: PluginOptions) -> Self {
        let channel = match grpc_channel(addr, &opts) {
            Ok(ch) => Some(ch),
            Err(e) => {
                error!(router = %name, "{}", e);
                None
            }
        };
        let token = opts.token.as_deref().and_then(|t| match t.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(router = %name, "token is not valid metadata, ignored");
                None
            }
        });
        Self {
            name: name.to_string(),
            channel,
            token,
        }
    }

    async fn get_route(&self, channel: Channel, dst: IpAddr) -> Result<GetRouteReply> {
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Error::Plugin(format!("service not ready: {}", e)))?;

        let mut request = tonic::Request::new(GetRouteRequest {
            dst: dst.to_string(),
        });
        if let Some(token) = &self.token {
            request.metadata_mut().insert("token", token.clone());
        }

        let codec = ProstCodec::<GetRouteRequest, GetRouteReply>::default();
        let reply = grpc
            .unary(request, PathAndQuery::from_static(GET_ROUTE_PATH), codec)
            .await
            .map_err(|status| Error::Plugin(status.to_string()))?;
        Ok(reply.into_inner())
    }
}

fn grpc_channel(addr: &str, opts: &PluginOptions) -> Result<Channel> {
    let scheme = if opts.tls { "https" } else { "http" };
    let uri = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("{}://{}", scheme, addr)
    };
    let mut endpoint = Endpoint::from_shared(uri)
        .map_err(|e| Error::Config(format!("invalid plugin address {}: {}", addr, e)))?
        .connect_timeout(opts.timeout)
        .timeout(opts.timeout);

    if opts.tls {
        if !opts.secure {
            warn!("gRPC plugin cannot skip certificate verification, verifying anyway");
        }
        let mut tls = ClientTlsConfig::new().with_webpki_roots();
        if let Some(server_name) = &opts.server_name {
            tls = tls.domain_name(server_name.clone());
        }
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| Error::Config(format!("plugin TLS: {}", e)))?;
    }
    Ok(endpoint.connect_lazy())
}

#[async_trait]
impl RouteResolver for GrpcPlugin {
    async fn resolve(&self, dst: IpAddr) -> Option<Route> {
        let channel = self.channel.clone()?;
        match self.get_route(channel, dst).await {
            Ok(reply) => parse_route(&reply.net, &reply.gateway),
            Err(e) => {
                error!(router = %self.name, dst = %dst, "{}", e);
                None
            }
        }
    }
}

#[derive(Serialize)]
struct HttpRouteRequest {
    dst: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct HttpRouteReply {
    net: String,
    gateway: String,
}

/// Route lookup over HTTP.
pub struct HttpPlugin {
    name: String,
    url: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpPlugin {
    pub fn new(name: &str, addr: &str, opts: PluginOptions) -> Result<Self> {
        let scheme = if opts.tls { "https" } else { "http" };
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("{}://{}", scheme, addr)
        };
        let client = reqwest::Client::builder()
            .timeout(opts.timeout)
            .danger_accept_invalid_certs(!opts.secure)
            .build()
            .map_err(|e| Error::Config(format!("plugin HTTP client: {}", e)))?;
        Ok(Self {
            name: name.to_string(),
            url,
            client,
            token: opts.token,
        })
    }

    async fn get_route(&self, dst: IpAddr) -> Result<HttpRouteReply> {
        let mut req = self.client.post(&self.url).json(&HttpRouteRequest {
            dst: dst.to_string(),
        });
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Plugin(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Plugin(format!("plugin returned status {}", status)));
        }
        resp.json()
            .await
            .map_err(|e| Error::Plugin(format!("bad reply: {}", e)))
    }
}

#[async_trait]
impl RouteResolver for HttpPlugin {
    async fn resolve(&self, dst: IpAddr) -> Option<Route> {
        match self.get_route(dst).await {
            Ok(reply) => parse_route(&reply.net, &reply.gateway),
            Err(e) => {
                error!(router = %self.name, dst = %dst, "{}", e);
                None
            }
        }
    }
}
