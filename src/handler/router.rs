//! [`RequestHandler`] backed by an axum [`Router`].

use axum::body::Body;
use axum::extract::Extension;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::StatusCode;
use serde_json::{json, Value};
use std::net::IpAddr;
use tower::ServiceExt;

use crate::handler::RequestHandler;
use crate::http::request::Request;
use crate::http::response::{status_response, Response};

/// Per-request caller details exposed to routes as an extension.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<IpAddr>,
    pub username: Option<String>,
}

/// Dispatches buffered requests through an axum router.
#[derive(Clone)]
pub struct RouterHandler {
    router: Router,
    body_limit: usize,
}

impl RouterHandler {
    pub fn new(router: Router, body_limit: usize) -> Self {
        Self { router, body_limit }
    }
}

impl RequestHandler for RouterHandler {
    fn handle(&self, req: Request) -> BoxFuture<'static, Response> {
        let router = self.router.clone();
        let limit = self.body_limit;
        let info = ClientInfo {
            ip: req.ip_address,
            username: req.session.as_ref().map(|s| s.username.clone()),
        };

        Box::pin(async move {
            let mut inner = req.into_inner().map(Body::from);
            inner.extensions_mut().insert(info);

            let res = match router.oneshot(inner).await {
                Ok(res) => res,
                Err(never) => match never {},
            };
            let (parts, body) = res.into_parts();
            match axum::body::to_bytes(body, limit).await {
                Ok(bytes) => Response::from_parts(parts, bytes),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to collect response body");
                    status_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        })
    }
}

/// Redfish service root routes.
pub fn service_root() -> Router {
    Router::new()
        .route("/redfish", get(redfish_versions))
        .route("/redfish/", get(redfish_versions))
        .route("/redfish/v1", get(service_root_v1))
        .route("/redfish/v1/", get(service_root_v1))
}

async fn redfish_versions() -> Json<Value> {
    Json(json!({ "v1": "/redfish/v1/" }))
}

async fn service_root_v1(Extension(client): Extension<ClientInfo>) -> Json<Value> {
    let mut root = json!({
        "@odata.id": "/redfish/v1",
        "@odata.type": "#ServiceRoot.v1_15_0.ServiceRoot",
        "Id": "RootService",
        "Name": "Root Service",
        "RedfishVersion": "1.17.0",
        "UUID": uuid::Uuid::new_v4().to_string(),
        "SessionService": { "@odata.id": "/redfish/v1/SessionService" },
        "Links": {
            "Sessions": { "@odata.id": "/redfish/v1/SessionService/Sessions" }
        },
    });
    if let Some(user) = client.username {
        root["Oem"] = json!({ "CurrentUser": user });
    }
    Json(root)
}
