//! Maps an observed contract state (or its absence) to a lifecycle handler.
//!
//! Dispatch is stateless: the resulting status depends only on what the chain
//! reader observed and on the timeout condition, never on the order's previous
//! status. A missed or duplicated poll is healed by the next successful read.

use chrono::{DateTime, Utc};

use super::lifecycle;
use crate::domain::{ChainSnapshot, ContractState, Order, OrderStatus, OrderTransition};

/// What the dispatcher decided for one observation
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Commit this transition
    Transition(Box<OrderTransition>),
    /// Nothing to do yet; poll again on the next tick
    Idle,
    /// The datum carried a state code no handler knows about
    Unknown(i64),
}

/// Dispatch a resolved chain snapshot to its handler.
pub fn dispatch(now: DateTime<Utc>, order: &Order, chain: &ChainSnapshot) -> Dispatch {
    let Ok(state) = ContractState::try_from(chain.datum.state) else {
        return Dispatch::Unknown(chain.datum.state);
    };

    let handler = match state {
        ContractState::Pending => lifecycle::handle_pending,
        ContractState::Returned => lifecycle::handle_returned,
        ContractState::Locking => lifecycle::handle_locking,
        ContractState::Canceled => lifecycle::handle_canceled,
        ContractState::Shipping => lifecycle::handle_shipping,
        ContractState::Appealed => lifecycle::handle_appealed,
        ContractState::Received => lifecycle::handle_received,
        ContractState::Collected => lifecycle::handle_collected,
    };

    Dispatch::Transition(Box::new(handler(now, order, chain)))
}

/// Dispatch when no UTXO holds the thread token.
///
/// Only an order that never left `created` can expire, and only once its
/// `watch_until` deadline has passed.
pub fn dispatch_not_found(now: DateTime<Utc>, order: &Order) -> Dispatch {
    if now > order.watch_until && order.status == OrderStatus::Created {
        Dispatch::Transition(Box::new(lifecycle::handle_expired(now, order)))
    } else {
        Dispatch::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DecodedDatum, TxInfo, Utxo};
    use chrono::Duration;
    use uuid::Uuid;

    fn order(status: OrderStatus) -> Order {
        let mut order = Order::new(
            Uuid::new_v4(),
            "policy.thread".to_string(),
            Utc::now() + Duration::hours(1),
        );
        order.status = status;
        order
    }

    fn snapshot(state: i64) -> ChainSnapshot {
        ChainSnapshot {
            utxo: Utxo {
                tx_hash: "tx".to_string(),
                output_index: 1,
                address: "addr_script".to_string(),
                data_hash: None,
            },
            tx: TxInfo {
                hash: "tx".to_string(),
                block: "block".to_string(),
                block_height: 10,
                block_time: 0,
            },
            metadata: Vec::new(),
            datum: DecodedDatum {
                state,
                delivery: None,
            },
        }
    }

    const ALL_STATUSES: [OrderStatus; 9] = [
        OrderStatus::Created,
        OrderStatus::Pending,
        OrderStatus::Locking,
        OrderStatus::Shipping,
        OrderStatus::Received,
        OrderStatus::Canceled,
        OrderStatus::Returned,
        OrderStatus::Appealed,
        OrderStatus::Collected,
    ];

    fn status_for_state(code: i64) -> Option<OrderStatus> {
        ContractState::try_from(code)
            .ok()
            .map(|state| state.phase().status())
    }

    #[test]
    fn test_state_table() {
        let table = [
            (0, OrderStatus::Pending),
            (-1, OrderStatus::Returned),
            (1, OrderStatus::Locking),
            (-2, OrderStatus::Canceled),
            (2, OrderStatus::Shipping),
            (-3, OrderStatus::Appealed),
            (3, OrderStatus::Received),
            (4, OrderStatus::Collected),
        ];
        for (code, status) in table {
            assert_eq!(status_for_state(code), Some(status));
        }
        assert_eq!(status_for_state(9), None);
    }

    #[test]
    fn test_dispatch_ignores_previous_status() {
        let now = Utc::now();
        for code in -3..=4 {
            let expected = status_for_state(code);
            for previous in ALL_STATUSES {
                let Dispatch::Transition(transition) =
                    dispatch(now, &order(previous), &snapshot(code))
                else {
                    panic!("state {code} should dispatch to a handler");
                };
                assert_eq!(transition.status(), expected);
            }
        }
    }

    #[test]
    fn test_only_collected_finishes() {
        let now = Utc::now();
        for code in -3..=4 {
            let Dispatch::Transition(transition) =
                dispatch(now, &order(OrderStatus::Created), &snapshot(code))
            else {
                panic!("state {code} should dispatch to a handler");
            };
            assert_eq!(transition.finished(), code == 4);
        }
    }

    #[test]
    fn test_unknown_state_is_not_fatal() {
        let dispatched = dispatch(Utc::now(), &order(OrderStatus::Pending), &snapshot(42));
        assert_eq!(dispatched, Dispatch::Unknown(42));
    }

    #[test]
    fn test_not_found_within_deadline_is_idle() {
        let now = Utc::now();
        assert_eq!(
            dispatch_not_found(now, &order(OrderStatus::Created)),
            Dispatch::Idle
        );
    }

    #[test]
    fn test_not_found_past_deadline_expires_created_order() {
        let now = Utc::now() + Duration::hours(2);
        let Dispatch::Transition(transition) = dispatch_not_found(now, &order(OrderStatus::Created))
        else {
            panic!("expected expiry");
        };
        assert_eq!(transition.status(), Some(OrderStatus::Expired));
        assert!(transition.finished());
        assert!(transition.notifications.is_empty());
    }

    #[test]
    fn test_not_found_past_deadline_keeps_progressed_order() {
        let now = Utc::now() + Duration::hours(2);
        assert_eq!(
            dispatch_not_found(now, &order(OrderStatus::Shipping)),
            Dispatch::Idle
        );
    }
}
