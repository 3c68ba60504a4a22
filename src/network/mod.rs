//! 网络模块
//!
//! 服务端由 [`Coordinator`] 整合 [`PairingSessionManager`](crate::pairing::PairingSessionManager)、
//! [`PresenceHub`](crate::presence::PresenceHub) 和设备库，每条客户端连接由
//! [`spawn_connection_loop`] 驱动；客户端通过 [`TransportClient`] 在同一连接上
//! 复用兑换请求和设备房间。连接以 JSON 文本帧传输 [`protocol`](crate::protocol) 中的消息。

mod client;
pub mod config;
mod event_loop;
mod manager;

pub use client::TransportClient;
pub use manager::{Coordinator, CoordinatorStatus};
pub(crate) use event_loop::spawn_connection_loop;

use tokio::sync::mpsc;

use crate::protocol::PresenceDelivery;

/// 在进程内建立一条客户端连接
///
/// 返回的客户端被丢弃后连接循环随之退出。
pub fn connect_local(
    coordinator: &Coordinator,
    user_id: &str,
) -> (TransportClient, mpsc::UnboundedReceiver<PresenceDelivery>) {
    let (to_server, server_inbound) = mpsc::unbounded_channel();
    let (server_outbound, to_client) = mpsc::unbounded_channel();
    spawn_connection_loop(
        coordinator.shared_refs(),
        user_id.to_string(),
        server_inbound,
        server_outbound,
    );
    TransportClient::new(user_id, to_server, to_client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::{DeviceCandidate, DeviceStatus, InMemoryRegistry};
    use crate::pairing::{PairingClientSession, SubmitOutcome};
    use crate::protocol::{PresenceEvent, RedeemFailure, RedeemOutcome};
    use crate::AppError;
    use super::config::PairingConfig;
    use std::sync::Arc;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    fn coordinator() -> (Arc<Coordinator>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(InMemoryRegistry::new()),
            clock.clone(),
            PairingConfig::default(),
        ));
        (coordinator, clock)
    }

    /// 等待连接循环处理完已发出的消息
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn pairing_over_transport_then_second_user_loses() {
        let (coordinator, clock) = coordinator();
        coordinator
            .pairing()
            .register_code("123456789", DeviceCandidate::new("tv-42", "Lobby TV"))
            .unwrap();

        let (u1, mut u1_presence) = connect_local(&coordinator, "U1");
        let (u2, _u2_presence) = connect_local(&coordinator, "U2");

        clock.advance(Duration::from_secs(10));
        assert_eq!(
            u1.redeem_as("123456789", "U1").await.unwrap(),
            RedeemOutcome::Success {
                device_id: "tv-42".into(),
                device_name: "Lobby TV".into(),
            }
        );

        clock.advance(Duration::from_secs(2));
        assert_eq!(
            u2.redeem_as("123456789", "U2").await.unwrap(),
            RedeemOutcome::failure(RedeemFailure::AlreadyConsumed)
        );

        // 兑换者的连接已自动加入设备房间
        coordinator
            .report_status("tv-42", DeviceStatus::Playing)
            .unwrap();
        let delivery = u1_presence.recv().await.unwrap();
        assert_eq!(delivery.device_id, "tv-42");
        assert_eq!(
            delivery.event,
            PresenceEvent::StatusChanged {
                status: DeviceStatus::Playing
            }
        );
    }

    #[tokio::test]
    async fn client_session_pairs_through_transport() {
        let (coordinator, _) = coordinator();
        coordinator
            .pairing()
            .register_code("555000111", DeviceCandidate::new("tv-5", "Hall"))
            .unwrap();

        let (client, _presence) = connect_local(&coordinator, "U1");
        let (session, _events) =
            PairingClientSession::new(Arc::new(client), "U1", coordinator.config());
        session.input("555-000-111");
        assert_eq!(
            session.submit().await,
            SubmitOutcome::Paired {
                device_id: "tv-5".into(),
                device_name: "Hall".into(),
            }
        );
    }

    #[tokio::test]
    async fn spoofed_user_id_is_rejected() {
        let (coordinator, _) = coordinator();
        coordinator
            .pairing()
            .register_code("123456789", DeviceCandidate::new("tv-42", "Lobby TV"))
            .unwrap();

        let (client, _presence) = connect_local(&coordinator, "U1");
        let err = client.redeem_as("123456789", "U2").await.unwrap_err();
        assert_eq!(err.kind(), "Unauthorized");
        assert_eq!(coordinator.pairing().pending_count(), 1);
    }

    #[tokio::test]
    async fn join_requires_ownership() {
        let (coordinator, _) = coordinator();
        coordinator
            .pairing()
            .register_code("123456789", DeviceCandidate::new("tv-42", "Lobby TV"))
            .unwrap();
        coordinator.pairing().redeem("123456789", "U1").unwrap();

        let (stranger, _presence) = connect_local(&coordinator, "U2");
        assert_eq!(
            stranger.join_room("tv-42").await.unwrap_err().kind(),
            "NotOwner"
        );
        assert_eq!(
            stranger.join_room("ghost").await.unwrap_err().kind(),
            "DeviceNotFound"
        );

        let (owner, _presence) = connect_local(&coordinator, "U1");
        let snapshot = owner.join_room("tv-42").await.unwrap();
        assert_eq!(snapshot.device_id, "tv-42");
        assert_eq!(snapshot.status, DeviceStatus::Online);

        // 重复加入、离开未加入的房间都不是错误
        owner.join_room("tv-42").await.unwrap();
        owner.leave_room("tv-42").await.unwrap();
        owner.leave_room("tv-42").await.unwrap();
    }

    #[tokio::test]
    async fn dissociation_removes_both_viewers() {
        let (coordinator, _) = coordinator();
        coordinator
            .pairing()
            .register_code("777777777", DeviceCandidate::new("tv-7", "Bar"))
            .unwrap();
        coordinator.pairing().redeem("777777777", "U1").unwrap();

        let (phone, mut phone_presence) = connect_local(&coordinator, "U1");
        let (tablet, mut tablet_presence) = connect_local(&coordinator, "U1");
        phone.join_room("tv-7").await.unwrap();
        tablet.join_room("tv-7").await.unwrap();

        coordinator.dissociate("tv-7", "U1").unwrap();
        for presence in [&mut phone_presence, &mut tablet_presence] {
            let delivery = presence.recv().await.unwrap();
            assert_eq!(delivery.event, PresenceEvent::DeviceRemoved);
        }
        assert!(!coordinator.presence().has_channel("tv-7"));

        assert!(matches!(
            coordinator.report_status("tv-7", DeviceStatus::Online),
            Err(AppError::DeviceNotFound(_))
        ));
        assert_eq!(coordinator.presence().publish("tv-7", PresenceEvent::DeviceRemoved), 0);
        settle().await;
        assert!(phone_presence.try_recv().is_err());
        assert!(tablet_presence.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_client_disconnects_subscriber() {
        let (coordinator, _) = coordinator();
        let (client, _presence) = connect_local(&coordinator, "U1");
        settle().await;
        assert_eq!(coordinator.presence().subscriber_count(), 1);

        drop(client);
        settle().await;
        assert_eq!(coordinator.presence().subscriber_count(), 0);
    }
}
