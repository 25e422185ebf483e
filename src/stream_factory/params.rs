//! Mapping a request and its proxy decision onto a pool and its parameters.

use std::sync::Arc;

use crate::auth::AuthController;
use crate::connect_job::{
    HttpProxyParams, ProxyConnection, SocksParams, SocksVersion, SslLowerParams, SslParams, TransportParams,
};
use crate::error::NetError;
use crate::net::address::HostPortPair;
use crate::net::tls::SslConfig;
use crate::pool::{ConnectionGroupKey, SocketType};
use crate::proxy::server::{ProxyScheme, ProxyServer};
use crate::session::SocketParams;

/// Everything that decides which socket a request gets.
pub(crate) struct Route<'a> {
    /// Host the request is for; names the certificate and the CONNECT target.
    pub origin: &'a HostPortPair,
    /// Where a direct connection goes. Differs from `origin` only for an
    /// alternative service.
    pub endpoint: &'a HostPortPair,
    pub is_https: bool,
    pub proxy: &'a ProxyServer,
    pub server_ssl: &'a SslConfig,
    pub proxy_ssl: &'a SslConfig,
    pub privacy_mode: bool,
    /// Required for HTTP-like proxies.
    pub proxy_auth: Option<Arc<AuthController>>,
}

/// Group key and pool parameters for `route`.
pub(crate) fn socket_request(route: Route<'_>) -> Result<(ConnectionGroupKey, SocketParams), NetError> {
    let socket_type = if route.is_https {
        SocketType::Ssl
    } else {
        SocketType::Plain
    };
    let fallback = (route.is_https && route.server_ssl.version_fallback).then_some(route.server_ssl.version_max);
    let key = ConnectionGroupKey::new(route.endpoint.clone(), socket_type, route.proxy.clone())
        .with_privacy_mode(route.privacy_mode)
        .with_ssl_fallback(fallback);

    let lower = match route.proxy.scheme() {
        ProxyScheme::Direct => Lower::Direct(TransportParams::new(route.endpoint.clone())),
        ProxyScheme::Socks4 | ProxyScheme::Socks5 => {
            let proxy_hp = proxy_address(route.proxy)?;
            Lower::Socks(SocksParams {
                transport: TransportParams::new(proxy_hp.clone()),
                destination: route.origin.clone(),
                version: if route.proxy.scheme() == ProxyScheme::Socks4 {
                    SocksVersion::V4
                } else {
                    SocksVersion::V5
                },
            })
        }
        ProxyScheme::Http | ProxyScheme::Https => {
            let proxy_hp = proxy_address(route.proxy)?;
            let auth = route
                .proxy_auth
                .ok_or(NetError::NotImplemented("http proxy without auth controller"))?;
            let connection = if route.proxy.is_https() {
                ProxyConnection::Tls(Box::new(SslParams {
                    lower: SslLowerParams::Direct(TransportParams::new(proxy_hp.clone())),
                    host: proxy_hp.clone(),
                    ssl_config: route.proxy_ssl.clone(),
                    is_proxy: true,
                }))
            } else {
                ProxyConnection::Plain(TransportParams::new(proxy_hp.clone()))
            };
            Lower::HttpProxy(HttpProxyParams {
                proxy: route.proxy.clone(),
                connection,
                destination: route.origin.clone(),
                tunnel: route.is_https,
                privacy_mode: route.privacy_mode,
                auth,
            })
        }
    };

    let params = if route.is_https {
        SocketParams::Ssl(SslParams {
            lower: match lower {
                Lower::Direct(p) => SslLowerParams::Direct(p),
                Lower::Socks(p) => SslLowerParams::Socks(p),
                Lower::HttpProxy(p) => SslLowerParams::HttpProxy(p),
            },
            host: route.origin.clone(),
            ssl_config: route.server_ssl.clone(),
            is_proxy: false,
        })
    } else {
        match lower {
            Lower::Direct(p) => SocketParams::Transport(p),
            Lower::Socks(p) => SocketParams::Socks(p),
            Lower::HttpProxy(p) => SocketParams::HttpProxy(p),
        }
    };
    Ok((key, params))
}

enum Lower {
    Direct(TransportParams),
    Socks(SocksParams),
    HttpProxy(HttpProxyParams),
}

fn proxy_address(proxy: &ProxyServer) -> Result<&HostPortPair, NetError> {
    proxy
        .host_port()
        .ok_or_else(|| NetError::InvalidUrl(proxy.to_string()))
}
