use actix::*;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use mesh_call::PeerId;
use uuid::Uuid;

use super::{client, moderator::Moderator};

#[get("/health_check")]
pub(super) async fn health_check() -> HttpResponse {
    HttpResponse::Ok().finish()
}

#[get("/ws")]
pub(super) async fn ws(
    req: HttpRequest,
    stream: web::Payload,
    moderator: web::Data<Addr<Moderator>>,
) -> Result<HttpResponse, Error> {
    let id = PeerId::new(Uuid::new_v4().to_string());
    let websocket = client::WsClient::new(id, moderator.get_ref().clone());
    client::start(websocket, &req, stream)
}
