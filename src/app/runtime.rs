//! Runtime - Configuration-driven service construction
//!
//! The runtime is responsible for:
//! - Building the named policies (admissions, bypasses, limiters, routers)
//! - Assembling one listener + handler pair per service
//! - Running the accept loops until shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bypass::Bypass;
use crate::common::{parse_duration, Address, Result};
use crate::config::{Config, RouterConfig, ServiceConfig};
use crate::error::Error;
use crate::handler::{Credentials, Handler, HandlerOptions};
use crate::layer::{Admission, MatcherAdmission, Pipeline, ProxyProtocolConfig};
use crate::limiter::{ConnLimiter, RateLimiter, SemaphoreConnLimiter, TrafficLimiter};
use crate::matcher::AddressMatcher;
use crate::router::{new_plugin, DirectDialer, PluginOptions, RouteResolver};
use crate::transport::{load_server_config, Listener, ListenerOptions};

use super::registry::Registry;
use super::stats_api::StatsCollector;

/// Pause after a transient accept error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A running listener and the handler it feeds.
pub struct Service {
    name: String,
    listener: Box<dyn Listener>,
    handler: Arc<dyn Handler>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.listener.local_addr()
    }
}

/// Named policies shared between services.
#[derive(Default)]
struct Policies {
    admissions: HashMap<String, Arc<dyn Admission>>,
    bypasses: HashMap<String, Arc<Bypass>>,
    limiters: HashMap<String, Arc<dyn TrafficLimiter>>,
    climiters: HashMap<String, Arc<dyn ConnLimiter>>,
    routers: HashMap<String, Arc<dyn RouteResolver>>,
}

impl Policies {
    fn build(config: &Config) -> Result<Self> {
        let mut p = Policies::default();
        for a in &config.admissions {
            let admission = MatcherAdmission::new(AddressMatcher::new(&a.matchers), a.whitelist);
            p.admissions.insert(a.name.clone(), Arc::new(admission));
        }
        for b in &config.bypasses {
            let bypass = Bypass::new(&b.name, AddressMatcher::new(&b.matchers), b.whitelist);
            p.bypasses.insert(b.name.clone(), Arc::new(bypass));
        }
        for l in &config.limiters {
            p.limiters
                .insert(l.name.clone(), Arc::new(RateLimiter::new(&l.limits)?));
        }
        for l in &config.climiters {
            p.climiters
                .insert(l.name.clone(), Arc::new(SemaphoreConnLimiter::new(&l.limits)?));
        }
        for r in &config.routers {
            p.routers.insert(r.name.clone(), build_router(r)?);
        }
        Ok(p)
    }
}

fn build_router(cfg: &RouterConfig) -> Result<Arc<dyn RouteResolver>> {
    let mut opts = PluginOptions {
        token: cfg.token.clone(),
        ..Default::default()
    };
    if let Some(tls) = &cfg.tls {
        opts.tls = true;
        opts.server_name = tls.server_name.clone();
        opts.secure = tls.secure;
    }
    if let Some(timeout) = cfg.timeout.as_deref() {
        opts.timeout = parse_duration(timeout)
            .ok_or_else(|| Error::Config(format!("router {}: invalid timeout {}", cfg.name, timeout)))?;
    }
    new_plugin(&cfg.name, &cfg.kind, &cfg.addr, opts)
}

/// Look up an optional named policy. References are checked by
/// [`Config::validate`], a miss here means the config was built by hand.
fn lookup<T: Clone>(map: &HashMap<String, T>, name: &Option<String>, kind: &str) -> Result<Option<T>> {
    match name {
        None => Ok(None),
        Some(n) => map
            .get(n)
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::Config(format!("unknown {} {}", kind, n))),
    }
}

/// Runtime manages the service lifecycle
pub struct Runtime {
    services: Vec<Arc<Service>>,
    collector: Arc<StatsCollector>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Build and bind every service of `config`.
    pub async fn from_config(config: &Config, registry: &Registry) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let policies = Policies::build(config)?;
        let mut collector = StatsCollector::new();

        let mut services = Vec::with_capacity(config.services.len());
        for svc in &config.services {
            let service = Self::build_service(svc, &policies, &mut collector, registry).await?;
            info!(
                "[{}] Listening on {} ({}/{})",
                svc.name,
                service.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| svc.addr.clone()),
                svc.listener.kind,
                svc.handler.kind
            );
            services.push(Arc::new(service));
        }

        Ok(Self {
            services,
            collector: Arc::new(collector),
            shutdown_tx,
        })
    }

    async fn build_service(
        svc: &ServiceConfig,
        policies: &Policies,
        collector: &mut StatsCollector,
        registry: &Registry,
    ) -> Result<Service> {
        let stats = collector.service(&svc.name);

        let mut pp = ProxyProtocolConfig {
            policy: svc.proxy_protocol,
            ..Default::default()
        };
        if let Some(timeout) = svc.proxy_protocol_timeout() {
            pp.timeout = timeout;
        }

        let mut pipeline = Pipeline::builder(svc.name.as_str())
            .proxy_protocol(pp)
            .metrics()
            .stats(stats.service.clone());
        if let Some(a) = lookup(&policies.admissions, &svc.admission, "admission")? {
            pipeline = pipeline.admission(a);
        }
        if let Some(l) = lookup(&policies.limiters, &svc.limiter, "limiter")? {
            pipeline = pipeline.traffic_limiter(l);
        }
        if let Some(l) = lookup(&policies.climiters, &svc.climiter, "climiter")? {
            pipeline = pipeline.conn_limiter(l);
        }

        let mut listener_opts =
            ListenerOptions::new(svc.name.as_str(), svc.addr.as_str()).with_pipeline(pipeline.build());
        if let Some(tls) = &svc.tls {
            listener_opts = listener_opts.with_tls(load_server_config(&tls.cert_file, &tls.key_file)?);
        }

        let mut dialer = DirectDialer::new();
        if let Some(r) = lookup(&policies.routers, &svc.router, "router")? {
            dialer = dialer.with_resolver(r);
        }
        let credentials = svc
            .handler
            .auth
            .iter()
            .fold(Credentials::new(), |c, u| c.with_user(&u.username, &u.password));
        let mut handler_opts = HandlerOptions::new(svc.name.as_str())
            .with_dialer(Arc::new(dialer))
            .with_credentials(credentials)
            .with_stats(stats.clients);
        if let Some(b) = lookup(&policies.bypasses, &svc.bypass, "bypass")? {
            handler_opts = handler_opts.with_bypass(b);
        }

        let handler = (registry.handler(&svc.handler.kind)?)(handler_opts, &svc.handler.metadata)?;
        let listener =
            (registry.listener(&svc.listener.kind)?)(listener_opts, svc.listener.metadata.clone()).await?;

        Ok(Service {
            name: svc.name.clone(),
            listener,
            handler,
        })
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    pub fn collector(&self) -> Arc<StatsCollector> {
        self.collector.clone()
    }

    /// Sender that stops [`Runtime::run`] and everything subscribed to it.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run every service until a shutdown is signalled.
    pub async fn run(&self) -> Result<()> {
        let mut handles = Vec::new();

        for service in &self.services {
            let service = service.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                run_service(service, &mut shutdown_rx).await;
            }));
        }

        info!("Runtime started with {} services", self.services.len());

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Like [`Runtime::run`], shutting down on Ctrl+C.
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
            }
            let _ = shutdown_tx.send(());
        });
        self.run().await
    }
}

/// Accept loop of a single service
async fn run_service(service: Arc<Service>, shutdown_rx: &mut broadcast::Receiver<()>) {
    let mut conn_count: u64 = 0;

    loop {
        tokio::select! {
            result = service.listener.accept() => {
                match result {
                    Ok(conn) => {
                        conn_count += 1;
                        let conn_id = conn_count;
                        let peer = conn.peer.clone();
                        debug!("[{}] New connection #{} from {}", service.name, conn_id, peer);

                        let handler = service.handler.clone();
                        let name = service.name.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(conn).await {
                                warn!("[{}] Connection #{} from {} error: {}", name, conn_id, peer, e);
                            }
                        });
                    }
                    Err(Error::Closed) => {
                        info!("[{}] Listener closed", service.name);
                        break;
                    }
                    Err(e) => {
                        error!("[{}] Accept error: {}", service.name, e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("[{}] Shutting down (handled {} connections)", service.name, conn_count);
                if let Err(e) = service.listener.close().await {
                    debug!("[{}] close: {}", service.name, e);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Metadata;
    use crate::config::{HandlerConfig, MatcherConfig, UserPass};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn socks_service(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            addr: "127.0.0.1:0".to_string(),
            handler: HandlerConfig {
                kind: "socks5".to_string(),
                auth: vec![UserPass {
                    username: "alice".to_string(),
                    password: "pw".to_string(),
                }],
                metadata: Metadata::new(),
            },
            ..Default::default()
        }
    }

    async fn socks_connect(proxy: std::net::SocketAddr, dst: std::net::SocketAddr) -> TcpStream {
        let mut s = TcpStream::connect(proxy).await.unwrap();
        s.write_all(&[5, 1, 2]).await.unwrap();
        let mut m = [0u8; 2];
        s.read_exact(&mut m).await.unwrap();
        assert_eq!(m, [5, 2]);

        s.write_all(&[1, 5, b'a', b'l', b'i', b'c', b'e', 2, b'p', b'w']).await.unwrap();
        s.read_exact(&mut m).await.unwrap();
        assert_eq!(m, [1, 0]);

        let std::net::SocketAddr::V4(v4) = dst else { panic!("ipv4 expected") };
        let mut req = vec![5, 1, 0, 1];
        req.extend_from_slice(&v4.ip().octets());
        req.extend_from_slice(&v4.port().to_be_bytes());
        s.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        s.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0);
        s
    }

    #[tokio::test]
    async fn test_socks5_service_end_to_end() {
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = s.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let config = Config {
            services: vec![socks_service("socks")],
            ..Default::default()
        };
        let runtime = Arc::new(Runtime::from_config(&config, &Registry::with_defaults()).await.unwrap());
        let proxy = runtime.services()[0].local_addr().unwrap().as_socket().unwrap();
        let shutdown = runtime.shutdown_handle();
        let task = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.run().await })
        };

        let mut s = socks_connect(proxy, echo_addr).await;
        s.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(s);

        let snapshot = runtime.collector().snapshot();
        assert_eq!(snapshot["socks"].service.total_conns, 1);
        assert!(snapshot["socks"].clients.contains_key("alice"));

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_admission_rejects_loopback() {
        let mut svc = socks_service("guarded");
        svc.admission = Some("deny-local".to_string());
        let config = Config {
            services: vec![svc],
            admissions: vec![MatcherConfig {
                name: "deny-local".to_string(),
                whitelist: false,
                matchers: vec!["127.0.0.0/8".to_string()],
            }],
            ..Default::default()
        };
        let runtime = Arc::new(Runtime::from_config(&config, &Registry::with_defaults()).await.unwrap());
        let proxy = runtime.services()[0].local_addr().unwrap().as_socket().unwrap();
        let shutdown = runtime.shutdown_handle();
        let task = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.run().await })
        };

        let mut s = TcpStream::connect(proxy).await.unwrap();
        let _ = s.write_all(&[5, 1, 0]).await;
        let mut buf = [0u8; 2];
        let r = tokio::time::timeout(Duration::from_secs(2), s.read(&mut buf)).await.unwrap();
        assert!(matches!(r, Ok(0) | Err(_)));

        shutdown.send(()).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_listener_type() {
        let mut svc = socks_service("odd");
        svc.listener.kind = "quic".to_string();
        let config = Config {
            services: vec![svc],
            ..Default::default()
        };
        let r = Runtime::from_config(&config, &Registry::with_defaults()).await;
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_router_timeout() {
        let config = Config {
            routers: vec![RouterConfig {
                name: "r".to_string(),
                kind: "http".to_string(),
                addr: "http://127.0.0.1:1/route".to_string(),
                token: None,
                tls: None,
                timeout: Some("soon".to_string()),
            }],
            ..Default::default()
        };
        let r = Runtime::from_config(&config, &Registry::with_defaults()).await;
        assert!(matches!(r, Err(Error::Config(_))));
    }
}
