//! In-memory COTPS service for integration testing.
//!
//! Implements `Transport`, so a real `CotpsClient` talks to it exactly as it
//! would to the network. Balance, issued tokens and open orders live in
//! shared state that tests can inspect and steer; every request is recorded.

#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use cotps_bot::config::AppConfig;
use cotps_bot::http::{HttpRequest, HttpResponse, RequestBody, Transport};
use cotps_bot::platforms::cotps::CotpsClient;
use cotps_bot::types::{ClientResult, Credentials};

pub const USERNAME: &str = "13800000000";
pub const PASSWORD: &str = "s3cret-pw";

pub const LOGIN: &str = "/api/mine/sso/user_login_check";
pub const BALANCE: &str = "/api/mine/user/getDealInfo";
pub const CREATE: &str = "/api/mine/user/createOrder";
pub const SUBMIT: &str = "/api/mine/user/submitOrder";

/// What the service saw, minus anything it does not care about.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub authorization: Option<String>,
    pub cookie: Option<String>,
    pub content_type: Option<String>,
    pub form: Option<Vec<(String, String)>>,
}

impl RecordedRequest {
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .as_ref()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

struct State {
    balance: Decimal,
    order_cost: Decimal,
    logins: u32,
    valid_token: Option<String>,
    reject_all_tokens: bool,
    /// Confirmations still accepted before every submit is refused.
    confirm_budget: Option<u32>,
    non_actionable_creations: u32,
    next_order: u64,
    open_orders: HashSet<String>,
    forced: VecDeque<(String, StatusCode, String)>,
    requests: Vec<RecordedRequest>,
}

/// Fake COTPS backend. Clones share state.
#[derive(Clone)]
pub struct FakeCotps {
    state: Arc<Mutex<State>>,
}

impl FakeCotps {
    /// A service holding `balance`, where each confirmed order costs 10.
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                balance,
                order_cost: dec!(10),
                logins: 0,
                valid_token: None,
                reject_all_tokens: false,
                confirm_budget: None,
                non_actionable_creations: 0,
                next_order: 1,
                open_orders: HashSet::new(),
                forced: VecDeque::new(),
                requests: Vec::new(),
            })),
        }
    }

    pub fn with_order_cost(self, cost: Decimal) -> Self {
        self.state.lock().unwrap().order_cost = cost;
        self
    }

    // -- Steering --

    /// Invalidate the current token, as if the server-side session lapsed.
    pub fn expire_session(&self) {
        self.state.lock().unwrap().valid_token = None;
    }

    /// Answer 401 to every authenticated request, even with a fresh token.
    pub fn reject_all_tokens(&self) {
        self.state.lock().unwrap().reject_all_tokens = true;
    }

    pub fn reject_confirmations(&self) {
        self.reject_confirmations_after(0);
    }

    /// Accept `n` more confirmations, then refuse every submit.
    pub fn reject_confirmations_after(&self, n: u32) {
        self.state.lock().unwrap().confirm_budget = Some(n);
    }

    /// The next `n` order creations report failure.
    pub fn queue_non_actionable(&self, n: u32) {
        self.state.lock().unwrap().non_actionable_creations = n;
    }

    /// Answer the next request to `path` with `status` and `body`.
    pub fn fail_next(&self, path: &str, status: StatusCode, body: &str) {
        self.state
            .lock()
            .unwrap()
            .forced
            .push_back((path.to_string(), status, body.to_string()));
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().unwrap().balance = balance;
    }

    // -- Inspection --

    pub fn balance(&self) -> Decimal {
        self.state.lock().unwrap().balance
    }

    pub fn login_count(&self) -> u32 {
        self.state.lock().unwrap().logins
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }

    // -- Wiring --

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// A client for the test account, using `cfg`.
    pub fn client_with(&self, cfg: &AppConfig) -> CotpsClient {
        CotpsClient::new(cfg, Credentials::new(USERNAME, PASSWORD), self.transport()).unwrap()
    }

    pub fn client(&self) -> CotpsClient {
        self.client_with(&AppConfig::default())
    }
}

fn header(req: &HttpRequest, name: reqwest::header::HeaderName) -> Option<String> {
    req.headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn json_ok(body: serde_json::Value) -> HttpResponse {
    HttpResponse::new(StatusCode::OK, body.to_string())
}

impl State {
    fn login(&mut self, req: &RecordedRequest) -> HttpResponse {
        let ok = req.method == Method::POST
            && req.form_value("mobile") == Some(USERNAME)
            && req.form_value("password") == Some(PASSWORD)
            && req.form_value("type") == Some("mobile");
        if !ok {
            return json_ok(json!({"success": false, "msg": "wrong password"}));
        }

        self.logins += 1;
        let token = format!("tok-{}", self.logins);
        self.valid_token = Some(token.clone());

        let mut resp = json_ok(json!({"success": true, "msg": "ok"}));
        resp.headers
            .insert(AUTHORIZATION, HeaderValue::from_str(&token).unwrap());
        let cookie = format!("JSESSIONID=sess-{}; Path=/; HttpOnly", self.logins);
        resp.headers
            .append(SET_COOKIE, HeaderValue::from_str(&cookie).unwrap());
        resp
    }

    fn authorized(&self, req: &RecordedRequest) -> bool {
        if self.reject_all_tokens {
            return false;
        }
        match (&self.valid_token, &req.authorization) {
            (Some(valid), Some(sent)) => sent == &format!("Bearer {valid}"),
            _ => false,
        }
    }

    fn create_order(&mut self) -> HttpResponse {
        if self.non_actionable_creations > 0 {
            self.non_actionable_creations -= 1;
            return json_ok(json!({"success": false, "msg": "no matching order"}));
        }
        let id = self.next_order;
        self.next_order += 1;
        self.open_orders.insert(id.to_string());
        json_ok(json!({"success": true, "data": {"orderId": id}}))
    }

    fn submit_order(&mut self, req: &RecordedRequest) -> HttpResponse {
        let order_id = req
            .query
            .iter()
            .find(|(k, _)| k == "orderId")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        match self.confirm_budget.as_mut() {
            Some(0) => return json_ok(json!({"success": false, "msg": "order expired"})),
            Some(left) => *left -= 1,
            None => {}
        }
        if !self.open_orders.remove(&order_id) {
            return json_ok(json!({"success": false, "msg": "unknown order"}));
        }
        self.balance = (self.balance - self.order_cost).max(Decimal::ZERO);
        json_ok(json!({"success": true, "msg": "submitted"}))
    }

    fn handle(&mut self, req: &RecordedRequest) -> HttpResponse {
        if let Some(pos) = self.forced.iter().position(|(p, _, _)| p == &req.path) {
            if let Some((_, status, body)) = self.forced.remove(pos) {
                return HttpResponse::new(status, body);
            }
        }

        if req.path == LOGIN {
            return self.login(req);
        }
        if !self.authorized(req) {
            return HttpResponse::new(StatusCode::UNAUTHORIZED, "token expired");
        }

        match req.path.as_str() {
            BALANCE => json_ok(json!({
                "success": true,
                "userinfo": {"balance": format!("{:.2}", self.balance)}
            })),
            CREATE => self.create_order(),
            SUBMIT => self.submit_order(req),
            _ => HttpResponse::new(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

#[async_trait]
impl Transport for FakeCotps {
    async fn execute(&self, request: HttpRequest) -> ClientResult<HttpResponse> {
        let recorded = RecordedRequest {
            method: request.method.clone(),
            path: request.url.path().to_string(),
            query: request.query.clone(),
            authorization: header(&request, AUTHORIZATION),
            cookie: header(&request, COOKIE),
            content_type: header(&request, CONTENT_TYPE),
            form: match &request.body {
                RequestBody::Form(pairs) => Some(pairs.clone()),
                _ => None,
            },
        };

        let mut state = self.state.lock().unwrap();
        let response = state.handle(&recorded);
        state.requests.push(recorded);
        Ok(response)
    }
}
