//! Lifecycle handlers: one pure transition function per contract state.
//!
//! A handler never touches I/O. It turns the freshly observed chain snapshot
//! into an [`OrderTransition`], which the order store commits in a single
//! transaction together with the notification batch.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    ChainSnapshot, ContractState, Counterparty, Notification, NotificationPayload, Order,
    OrderStatus, OrderTransition, OrderUpdate, Phase, PhaseRecord,
};

/// Recipient and message template of one notification. `{title}` is replaced
/// with the order title.
type Audience = &'static [(Counterparty, &'static str)];

const PENDING: Audience = &[
    (
        Counterparty::Buyer,
        "Your payment for \"{title}\" is on-chain. Waiting for the seller to accept.",
    ),
    (
        Counterparty::Seller,
        "New order for \"{title}\". Lock your collateral to accept it.",
    ),
];

const LOCKING: Audience = &[
    (
        Counterparty::Buyer,
        "The seller accepted your order for \"{title}\".",
    ),
    (
        Counterparty::Seller,
        "Collateral for \"{title}\" is locked. Ship the item before the delivery deadline.",
    ),
];

const SHIPPING: Audience = &[(
    Counterparty::Buyer,
    "\"{title}\" has been shipped. Confirm receipt once it arrives.",
)];

const RECEIVED: Audience = &[(
    Counterparty::Seller,
    "The buyer confirmed receipt of \"{title}\". You can now collect your funds.",
)];

const COLLECTED: Audience = &[(
    Counterparty::Seller,
    "Funds for \"{title}\" have been collected. The order is complete.",
)];

const CANCELED: Audience = &[
    (Counterparty::Buyer, "Your order for \"{title}\" was canceled."),
    (Counterparty::Seller, "The order for \"{title}\" was canceled."),
];

const RETURNED: Audience = &[
    (
        Counterparty::Buyer,
        "Your payment for \"{title}\" was returned to you.",
    ),
    (
        Counterparty::Seller,
        "The order for \"{title}\" was returned to the buyer.",
    ),
];

const APPEALED: Audience = &[
    (
        Counterparty::Buyer,
        "An appeal was opened on the order for \"{title}\".",
    ),
    (
        Counterparty::Seller,
        "An appeal was opened on the order for \"{title}\".",
    ),
];

pub fn handle_pending(now: DateTime<Utc>, order: &Order, chain: &ChainSnapshot) -> OrderTransition {
    settle(ContractState::Pending, PENDING, now, order, chain)
}

pub fn handle_locking(now: DateTime<Utc>, order: &Order, chain: &ChainSnapshot) -> OrderTransition {
    settle(ContractState::Locking, LOCKING, now, order, chain)
}

pub fn handle_shipping(
    now: DateTime<Utc>,
    order: &Order,
    chain: &ChainSnapshot,
) -> OrderTransition {
    settle(ContractState::Shipping, SHIPPING, now, order, chain)
}

pub fn handle_received(
    now: DateTime<Utc>,
    order: &Order,
    chain: &ChainSnapshot,
) -> OrderTransition {
    settle(ContractState::Received, RECEIVED, now, order, chain)
}

/// The only success terminal: marks the order finished.
pub fn handle_collected(
    now: DateTime<Utc>,
    order: &Order,
    chain: &ChainSnapshot,
) -> OrderTransition {
    settle(ContractState::Collected, COLLECTED, now, order, chain)
}

pub fn handle_canceled(
    now: DateTime<Utc>,
    order: &Order,
    chain: &ChainSnapshot,
) -> OrderTransition {
    settle(ContractState::Canceled, CANCELED, now, order, chain)
}

pub fn handle_returned(
    now: DateTime<Utc>,
    order: &Order,
    chain: &ChainSnapshot,
) -> OrderTransition {
    settle(ContractState::Returned, RETURNED, now, order, chain)
}

pub fn handle_appealed(
    now: DateTime<Utc>,
    order: &Order,
    chain: &ChainSnapshot,
) -> OrderTransition {
    settle(ContractState::Appealed, APPEALED, now, order, chain)
}

/// Timeout terminal. Nobody is notified.
///
/// The caller checks `watch_until` and the `created` status before calling.
pub fn handle_expired(now: DateTime<Utc>, order: &Order) -> OrderTransition {
    OrderTransition {
        order_id: order.id,
        expected_version: order.version,
        update: OrderUpdate::new()
            .status(OrderStatus::Expired)
            .finished(true)
            .scanned_at(now),
        notifications: Vec::new(),
    }
}

fn settle(
    state: ContractState,
    audience: Audience,
    now: DateTime<Utc>,
    order: &Order,
    chain: &ChainSnapshot,
) -> OrderTransition {
    let phase = state.phase();
    let status = phase.status();

    // The notified flag is the at-most-once guard across retries.
    let notifications = if order.phases.get(phase).notified {
        Vec::new()
    } else {
        audience
            .iter()
            .map(|(recipient, template)| notification(phase, *recipient, template, now, order, chain))
            .collect()
    };

    let record = PhaseRecord {
        tx: Some(chain.tx.hash.clone()),
        block: Some(chain.tx.block_height),
        metadata: Some(chain.metadata_json()),
        notified: true,
    };

    OrderTransition {
        order_id: order.id,
        expected_version: order.version,
        update: OrderUpdate::new()
            .status(status)
            .finished(status.is_terminal())
            .contract_state(state)
            .phase(phase, record)
            .scanned_at(now),
        notifications,
    }
}

fn notification(
    phase: Phase,
    recipient: Counterparty,
    template: &str,
    now: DateTime<Utc>,
    order: &Order,
    chain: &ChainSnapshot,
) -> Notification {
    let owner_id = match recipient {
        Counterparty::Buyer => order.buyer_id.clone(),
        Counterparty::Seller => order.seller_id.clone(),
    };

    let status = phase.status();
    Notification {
        id: Uuid::now_v7(),
        phase,
        recipient,
        owner_id,
        title: headline(phase).to_string(),
        message: template.replace("{title}", &order.title),
        payload: NotificationPayload {
            order_id: order.id,
            status,
            tx_hash: Some(chain.tx.hash.clone()),
            block: Some(chain.tx.block_height),
            buyer_address: order.buyer_address.clone(),
            seller_address: order.seller_address.clone(),
        },
        created_at: now,
    }
}

fn headline(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => "Order placed",
        Phase::Locking => "Order accepted",
        Phase::Shipping => "Order shipped",
        Phase::Received => "Order received",
        Phase::Collected => "Funds collected",
        Phase::Canceled => "Order canceled",
        Phase::Returned => "Payment returned",
        Phase::Appealed => "Appeal opened",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DecodedDatum, TxInfo, TxMetadata, Utxo};
    use chrono::Duration;

    fn order() -> Order {
        let mut order = Order::new(
            Uuid::new_v4(),
            "policy.thread".to_string(),
            Utc::now() + Duration::hours(1),
        );
        order.title = "Vintage camera".to_string();
        order.buyer_id = "buyer-1".to_string();
        order.buyer_address = "addr_buyer".to_string();
        order.seller_id = "seller-1".to_string();
        order.seller_address = "addr_seller".to_string();
        order.version = 4;
        order
    }

    fn snapshot(state: i64) -> ChainSnapshot {
        ChainSnapshot {
            utxo: Utxo {
                tx_hash: "tx_abc".to_string(),
                output_index: 0,
                address: "addr_script".to_string(),
                data_hash: Some("datum_hash".to_string()),
            },
            tx: TxInfo {
                hash: "tx_abc".to_string(),
                block: "block_hash".to_string(),
                block_height: 1200,
                block_time: 1_700_000_000,
            },
            metadata: vec![TxMetadata {
                label: "674".to_string(),
                json_metadata: serde_json::json!({"msg": ["escrow"]}),
            }],
            datum: DecodedDatum {
                state,
                delivery: None,
            },
        }
    }

    #[test]
    fn test_pending_notifies_buyer_and_seller() {
        let now = Utc::now();
        let order = order();
        let transition = handle_pending(now, &order, &snapshot(0));

        assert_eq!(transition.status(), Some(OrderStatus::Pending));
        assert!(!transition.finished());
        assert_eq!(transition.expected_version, 4);
        assert_eq!(transition.notifications.len(), 2);

        let owners: Vec<_> = transition
            .notifications
            .iter()
            .map(|n| n.owner_id.as_str())
            .collect();
        assert_eq!(owners, vec!["buyer-1", "seller-1"]);
        assert!(transition.notifications[0].message.contains("Vintage camera"));

        let (phase, record) = transition.update.phase.clone().unwrap();
        assert_eq!(phase, Phase::Pending);
        assert!(record.notified);
        assert_eq!(record.tx.as_deref(), Some("tx_abc"));
        assert_eq!(record.block, Some(1200));
        assert_eq!(transition.update.contract_state, Some(0));
        assert_eq!(transition.update.scanned_at, Some(now));
    }

    #[test]
    fn test_already_notified_phase_builds_no_notifications() {
        let mut order = order();
        order.phases.pending.notified = true;
        let transition = handle_pending(Utc::now(), &order, &snapshot(0));

        assert!(transition.notifications.is_empty());
        assert_eq!(transition.status(), Some(OrderStatus::Pending));
        let (_, record) = transition.update.phase.unwrap();
        assert!(record.notified);
    }

    #[test]
    fn test_collected_finishes_and_notifies_seller_only() {
        let transition = handle_collected(Utc::now(), &order(), &snapshot(4));

        assert_eq!(transition.status(), Some(OrderStatus::Collected));
        assert!(transition.finished());
        assert_eq!(transition.notifications.len(), 1);
        assert_eq!(transition.notifications[0].recipient, Counterparty::Seller);
        assert_eq!(transition.notifications[0].phase, Phase::Collected);
    }

    #[test]
    fn test_expired_finishes_without_notifications() {
        let now = Utc::now();
        let order = order();
        let transition = handle_expired(now, &order);

        assert_eq!(transition.status(), Some(OrderStatus::Expired));
        assert!(transition.finished());
        assert!(transition.notifications.is_empty());
        assert!(transition.update.phase.is_none());
        assert_eq!(transition.update.scanned_at, Some(now));
    }

    #[test]
    fn test_intermediate_handlers_leave_order_unfinished() {
        let order = order();
        let now = Utc::now();
        let cases = [
            (handle_pending(now, &order, &snapshot(0)), 2),
            (handle_locking(now, &order, &snapshot(1)), 2),
            (handle_shipping(now, &order, &snapshot(2)), 1),
            (handle_received(now, &order, &snapshot(3)), 1),
            (handle_returned(now, &order, &snapshot(-1)), 2),
            (handle_canceled(now, &order, &snapshot(-2)), 2),
            (handle_appealed(now, &order, &snapshot(-3)), 2),
        ];
        for (transition, expected_notifications) in cases {
            assert!(!transition.finished());
            assert_eq!(transition.update.finished, Some(false));
            assert_eq!(transition.notifications.len(), expected_notifications);
        }
    }

    #[test]
    fn test_notification_payload_carries_chain_data() {
        let transition = handle_shipping(Utc::now(), &order(), &snapshot(2));
        let notification = &transition.notifications[0];

        assert_eq!(notification.recipient, Counterparty::Buyer);
        assert_eq!(notification.title, "Order shipped");
        assert_eq!(notification.payload.status, OrderStatus::Shipping);
        assert_eq!(notification.payload.tx_hash.as_deref(), Some("tx_abc"));
        assert_eq!(notification.payload.seller_address, "addr_seller");
    }
}
