//! Registry - listener and handler constructors by type name
//!
//! Built once at startup and handed to [`super::Runtime::from_config`];
//! nothing is registered globally.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::common::{Metadata, Result};
use crate::error::Error;
use crate::handler::{Handler, HandlerOptions, RedirectHandler, Socks5Handler};
use crate::transport::{
    Listener, ListenerOptions, MtcpListener, RedirectTcpListener, TcpListener, TlsListener,
    UdpConnListener, UnixListener,
};

pub type ListenerFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Listener>>> + Send>>;
pub type ListenerFactory = Arc<dyn Fn(ListenerOptions, Metadata) -> ListenerFuture + Send + Sync>;
pub type HandlerFactory =
    Arc<dyn Fn(HandlerOptions, &Metadata) -> Result<Arc<dyn Handler>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    listeners: HashMap<String, ListenerFactory>,
    handlers: HashMap<String, HandlerFactory>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Every listener and handler this crate ships.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register_listener("tcp", TcpListener::listen);
        r.register_listener("tls", TlsListener::listen);
        r.register_listener("unix", UnixListener::listen);
        for name in ["red", "redir", "redirect"] {
            r.register_listener(name, RedirectTcpListener::listen);
        }
        r.register_listener("redu", UdpConnListener::listen);
        r.register_listener("mtcp", MtcpListener::listen);

        for name in ["socks5", "socks"] {
            r.register_handler(name, |opts, md| {
                Ok(Arc::new(Socks5Handler::new(opts, md)) as Arc<dyn Handler>)
            });
        }
        for name in ["red", "redir", "redirect"] {
            r.register_handler(name, |opts, _md| {
                Ok(Arc::new(RedirectHandler::new(opts)) as Arc<dyn Handler>)
            });
        }
        r
    }

    pub fn register_listener<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: Fn(ListenerOptions, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Listener>>> + Send + 'static,
    {
        let factory: ListenerFactory = Arc::new(move |opts, md| Box::pin(factory(opts, md)));
        self.listeners.insert(name.to_string(), factory);
    }

    pub fn register_handler<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(HandlerOptions, &Metadata) -> Result<Arc<dyn Handler>> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(factory));
    }

    pub fn listener(&self, name: &str) -> Result<ListenerFactory> {
        self.listeners
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown listener type: {}", name)))
    }

    pub fn handler(&self, name: &str) -> Result<HandlerFactory> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown handler type: {}", name)))
    }

    /// Registered listener type names, sorted.
    pub fn listener_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.listeners.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_registered() {
        let r = Registry::with_defaults();
        assert_eq!(
            r.listener_names(),
            ["mtcp", "red", "redir", "redirect", "redu", "tcp", "tls", "unix"]
        );
        assert!(r.handler("socks5").is_ok());
        assert!(r.handler("redirect").is_ok());
    }

    #[test]
    fn test_unknown_type() {
        let r = Registry::new();
        assert!(matches!(r.listener("tcp"), Err(Error::Config(_))));
        assert!(matches!(r.handler("http"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_custom_listener_factory() {
        let mut r = Registry::new();
        r.register_listener("plain", TcpListener::listen);
        let factory = r.listener("plain").unwrap();
        let ln = factory(ListenerOptions::new("t", "127.0.0.1:0"), Metadata::new())
            .await
            .unwrap();
        assert_ne!(ln.local_addr().unwrap().port(), 0);
        ln.close().await.unwrap();
    }
}
