use std::sync::Arc;

use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, Message, StreamHandler};
use actix_web_actors::ws;
use derivative::Derivative;
use uuid::Uuid;

use crate::{
    error::{Error, TransportErrorKind},
    signaling::{
        message::SignalMsg,
        room::{RoomMember, RoomRegistry},
    },
};

/// Server side of one websocket joined to a room.
#[derive(Debug)]
pub struct WsSession {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    rooms: Arc<RoomRegistry>,
}

impl WsSession {
    pub fn new(room_id: String, user_id: String, rooms: Arc<RoomRegistry>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id,
            user_id,
            rooms,
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let msg = match SignalMsg::from_json(text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(
                    "[{}] {} sent an invalid envelope: {}",
                    self.room_id,
                    self.user_id,
                    err
                );
                return;
            }
        };
        if let Some(reply) = self.relay(msg) {
            match reply.to_json() {
                Ok(text) => ctx.text(text),
                Err(err) => tracing::error!("Failed to encode status: {}", err),
            }
        }
    }

    /// The sender and room of an envelope are the ones this socket joined with, whatever the client claims.
    fn stamp(&self, msg: &mut SignalMsg) {
        if msg.from != self.user_id {
            if !msg.from.is_empty() {
                tracing::debug!(
                    "[{}] {} claimed to be {}, overwriting",
                    self.room_id,
                    self.user_id,
                    msg.from
                );
            }
            msg.from = self.user_id.clone();
        }
        msg.room_id = Some(self.room_id.clone());
    }

    /// Routes `msg` and returns the status envelope owed to the sender, if any.
    fn relay(&self, mut msg: SignalMsg) -> Option<SignalMsg> {
        self.stamp(&mut msg);
        tracing::trace!("[{}] received from {}: {:?}", self.room_id, self.user_id, msg);

        let recipient = msg.recipient().map(str::to_owned);
        match (self.rooms.route(&msg), recipient) {
            (Ok(_), None) => Some(SignalMsg::status(200, "Send broadcast msg successfully")),
            (Ok(_), Some(to)) => Some(SignalMsg::status(200, format!("Sent to {}", to))),
            (Err(err), None) => {
                tracing::warn!("[{}] {} failed to broadcast: {}", self.room_id, self.user_id, err);
                None
            }
            (Err(err), Some(to)) => {
                tracing::warn!("[{}] {} failed to route message: {}", self.room_id, self.user_id, err);
                Some(SignalMsg::status(500, format!("Failed to send message to {}", to)))
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::debug!(
            "WebSocket session id={} is started for user_id={}",
            self.id,
            self.user_id
        );
        let handle = SessionHandle {
            addr: ctx.address(),
            session_id: self.id.clone(),
        };
        self.rooms
            .join(&self.room_id, &self.user_id, &self.id, Arc::new(handle));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.rooms.leave(&self.room_id, &self.user_id, &self.id);
        tracing::debug!("WebSocket session id={} is stopped", self.id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => (),
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(bin)) => match std::str::from_utf8(&bin) {
                Ok(text) => self.handle_text(text, ctx),
                Err(err) => tracing::warn!("Ignoring non UTF-8 binary frame: {}", err),
            },
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => (),
            Err(err) => {
                tracing::error!("WebSocket session id={} protocol error: {}", self.id, err);
                ctx.stop();
            }
        }
    }
}

/// Messages delivered to a session from other sessions.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub enum Outbound {
    Text(String),
    Close,
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) -> Self::Result {
        match msg {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Close => {
                tracing::debug!("WebSocket session id={} is replaced", self.id);
                ctx.close(Some(ws::CloseCode::Policy.into()));
                ctx.stop();
            }
        }
    }
}

/// The registry's view of a [`WsSession`].
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct SessionHandle {
    #[derivative(Debug = "ignore")]
    addr: Addr<WsSession>,
    session_id: String,
}

impl RoomMember for SessionHandle {
    fn send_text(&self, text: String) -> Result<(), Error> {
        if !self.addr.connected() {
            return Err(Error::new_transport(
                format!("WebSocket session id={} is closed", self.session_id),
                TransportErrorKind::ClosedError,
            ));
        }
        self.addr.do_send(Outbound::Text(text));
        Ok(())
    }

    fn close(&self) {
        self.addr.do_send(Outbound::Close);
    }
}
