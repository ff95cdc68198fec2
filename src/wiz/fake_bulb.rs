//! A bulb on loopback that speaks just enough of the protocol for tests.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use serde_json::{json, Value};
use tokio::{net::UdpSocket, task::JoinHandle};

use super::protocol::{SetPilotParams, WizRequest};
use crate::protocols::udp::RECV_BUFFER_SIZE;

#[derive(Debug, Default)]
pub struct FakeState {
    pub pilot: SetPilotParams,
    pub received: Vec<WizRequest>,
    pub answer_registration: bool,
    pub silent: bool,
    pub reject_with: Option<(i64, String)>,
}

pub struct FakeBulb {
    pub addr: SocketAddr,
    pub mac: String,
    pub state: Arc<Mutex<FakeState>>,
    handle: JoinHandle<()>,
}

impl FakeBulb {
    pub async fn start(mac: &str) -> FakeBulb {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let state = Arc::new(Mutex::new(FakeState {
            answer_registration: true,
            ..Default::default()
        }));

        let handle = {
            let state = state.clone();
            let mac = mac.to_string();

            tokio::spawn(async move {
                let mut buf = [0u8; RECV_BUFFER_SIZE];
                while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                    let Ok(request) = serde_json::from_slice::<WizRequest>(&buf[..len]) else {
                        continue;
                    };

                    let reply = handle_request(&state, &mac, request);
                    if let Some(reply) = reply {
                        let _ = socket.send_to(reply.to_string().as_bytes(), from).await;
                    }
                }
            })
        };

        FakeBulb {
            addr,
            mac: mac.to_string(),
            state,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_pilot(&self, pilot: SetPilotParams) {
        self.state.lock().unwrap().pilot = pilot;
    }

    pub fn received(&self) -> Vec<WizRequest> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }
}

impl Drop for FakeBulb {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn merge(current: &mut SetPilotParams, update: &SetPilotParams) {
    macro_rules! take {
        ($($field:ident),*) => {
            $(if update.$field.is_some() {
                current.$field = update.$field;
            })*
        };
    }

    // A bulb only ever renders one of scene, temperature or color
    if update.scene_id.is_some() || update.temp.is_some() || update.color().is_some() {
        current.scene_id = None;
        current.temp = None;
        current.r = None;
        current.g = None;
        current.b = None;
    }

    take!(state, dimming, temp, r, g, b, c, w, speed, scene_id);
}

fn handle_request(state: &Mutex<FakeState>, mac: &str, request: WizRequest) -> Option<Value> {
    let mut state = state.lock().unwrap();
    state.received.push(request.clone());

    if state.silent {
        return None;
    }

    match request {
        WizRequest::Registration(_) if !state.answer_registration => None,
        WizRequest::Registration(_) => Some(json!({
            "method": "registration",
            "env": "pro",
            "result": {"mac": mac, "success": true}
        })),
        WizRequest::GetPilot(_) => {
            let mut result = serde_json::to_value(&state.pilot).unwrap();
            result["mac"] = json!(mac);
            result["rssi"] = json!(-60);
            Some(json!({"method": "getPilot", "env": "pro", "result": result}))
        }
        WizRequest::SetPilot(params) => match &state.reject_with {
            Some((code, message)) => Some(json!({
                "method": "setPilot",
                "env": "pro",
                "error": {"code": code, "message": message}
            })),
            None => {
                merge(&mut state.pilot, &params);
                Some(json!({"method": "setPilot", "env": "pro", "result": {"success": true}}))
            }
        },
    }
}
