//! Order lifecycle state machine.
//!
//! Statuses and transitions are fixed by the table in `allowed_transitions`;
//! applying an event returns a new record or a structured transition error.
//! Terminal states reject every further event. Fill accounting enforces
//! `filled_quantity_base <= quantity_base`, with equality exactly in FILLED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Amount, MarketKind, OrderSide, OrderType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Submitted,
    Acked,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Acked => "ACKED",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }
}

/// The transition table. Every legal `(from, to)` pair appears here;
/// everything else is a hard error.
pub fn allowed_transitions(from: OrderStatus) -> &'static [OrderStatus] {
    match from {
        OrderStatus::Created => &[OrderStatus::Submitted],
        OrderStatus::Submitted => &[OrderStatus::Acked, OrderStatus::Rejected, OrderStatus::Canceled],
        OrderStatus::Acked => &[
            OrderStatus::Partial,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
        ],
        OrderStatus::Partial => &[OrderStatus::Partial, OrderStatus::Filled, OrderStatus::Canceled],
        OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected => &[],
    }
}

/// Events driving the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    Submit,
    Ack { exchange_order_id: String },
    PartialFill { filled_qty_base: Amount, avg_price_quote: Amount },
    Fill { filled_qty_base: Amount, avg_price_quote: Amount },
    Cancel { reason: String },
    Reject { error: String },
    /// Maps to CANCELED with a timeout note.
    Timeout { reason: String },
}

impl OrderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrderEvent::Submit => "SUBMIT",
            OrderEvent::Ack { .. } => "ACK",
            OrderEvent::PartialFill { .. } => "PARTIAL_FILL",
            OrderEvent::Fill { .. } => "FILL",
            OrderEvent::Cancel { .. } => "CANCEL",
            OrderEvent::Reject { .. } => "REJECT",
            OrderEvent::Timeout { .. } => "TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("event {event} not allowed in status {from:?}")]
    InvalidTransition { from: OrderStatus, event: &'static str },
    #[error("order is terminal in status {from:?}, event {event} rejected")]
    Terminal { from: OrderStatus, event: &'static str },
    #[error("fill of {fill_base} would exceed order quantity ({filled_base}/{quantity_base})")]
    OverFill { quantity_base: Amount, filled_base: Amount, fill_base: Amount },
    #[error("final fill leaves order short ({filled_base}/{quantity_base})")]
    ShortFill { quantity_base: Amount, filled_base: Amount },
}

/// Tracked order record. Created when an execution job enqueues work,
/// mutated only through [`ManagedOrder::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedOrder {
    pub id: String,
    pub intent_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub market: MarketKind,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity_base: Amount,
    pub filled_quantity_base: Amount,
    pub price_quote: Option<Amount>,
    pub avg_fill_price_quote: Option<Amount>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub reject_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedOrder {
    pub fn new(
        intent_id: impl Into<String>,
        symbol: impl Into<String>,
        market: MarketKind,
        side: OrderSide,
        order_type: OrderType,
        quantity_base: Amount,
        price_quote: Option<Amount>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            intent_id: intent_id.into(),
            exchange_order_id: None,
            symbol: symbol.into(),
            market,
            side,
            order_type,
            status: OrderStatus::Created,
            quantity_base,
            filled_quantity_base: 0,
            price_quote,
            avg_fill_price_quote: None,
            submitted_at: None,
            acked_at: None,
            cancel_reason: None,
            reject_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_base(&self) -> Amount {
        self.quantity_base - self.filled_quantity_base
    }

    /// Apply one event, returning the successor record.
    pub fn apply(&self, event: &OrderEvent) -> Result<ManagedOrder, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal { from: self.status, event: event.name() });
        }

        let target = match event {
            OrderEvent::Submit => OrderStatus::Submitted,
            OrderEvent::Ack { .. } => OrderStatus::Acked,
            OrderEvent::PartialFill { .. } => OrderStatus::Partial,
            OrderEvent::Fill { .. } => OrderStatus::Filled,
            OrderEvent::Cancel { .. } | OrderEvent::Timeout { .. } => OrderStatus::Canceled,
            OrderEvent::Reject { .. } => OrderStatus::Rejected,
        };

        if !allowed_transitions(self.status).contains(&target) {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                event: event.name(),
            });
        }

        let mut next = self.clone();
        next.status = target;
        next.updated_at = Utc::now();

        match event {
            OrderEvent::Submit => {
                next.submitted_at = Some(next.updated_at);
            }
            OrderEvent::Ack { exchange_order_id } => {
                next.exchange_order_id = Some(exchange_order_id.clone());
                next.acked_at = Some(next.updated_at);
            }
            OrderEvent::PartialFill { filled_qty_base, avg_price_quote } => {
                let filled = self.filled_quantity_base + filled_qty_base;
                if filled >= self.quantity_base {
                    return Err(TransitionError::OverFill {
                        quantity_base: self.quantity_base,
                        filled_base: self.filled_quantity_base,
                        fill_base: *filled_qty_base,
                    });
                }
                next.filled_quantity_base = filled;
                next.avg_fill_price_quote = Some(*avg_price_quote);
            }
            OrderEvent::Fill { filled_qty_base, avg_price_quote } => {
                let filled = self.filled_quantity_base + filled_qty_base;
                if filled > self.quantity_base {
                    return Err(TransitionError::OverFill {
                        quantity_base: self.quantity_base,
                        filled_base: self.filled_quantity_base,
                        fill_base: *filled_qty_base,
                    });
                }
                if filled < self.quantity_base {
                    return Err(TransitionError::ShortFill {
                        quantity_base: self.quantity_base,
                        filled_base: filled,
                    });
                }
                next.filled_quantity_base = filled;
                next.avg_fill_price_quote = Some(*avg_price_quote);
            }
            OrderEvent::Cancel { reason } => {
                next.cancel_reason = Some(reason.clone());
            }
            OrderEvent::Timeout { reason } => {
                next.cancel_reason = Some(format!("timeout: {reason}"));
            }
            OrderEvent::Reject { error } => {
                next.reject_error = Some(error.clone());
            }
        }

        debug_assert!(next.filled_quantity_base <= next.quantity_base);
        debug_assert!(
            (next.status == OrderStatus::Filled)
                == (next.filled_quantity_base == next.quantity_base)
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> ManagedOrder {
        ManagedOrder::new(
            "intent-1",
            "BTCUSDT",
            MarketKind::Perp,
            OrderSide::Sell,
            OrderType::Market,
            100,
            None,
        )
    }

    #[test]
    fn test_full_lifecycle_with_partial_fill() {
        let o = order();
        assert_eq!(o.status, OrderStatus::Created);

        let o = o.apply(&OrderEvent::Submit).unwrap();
        assert_eq!(o.status, OrderStatus::Submitted);
        assert!(o.submitted_at.is_some());

        let o = o.apply(&OrderEvent::Ack { exchange_order_id: "X1".into() }).unwrap();
        assert_eq!(o.status, OrderStatus::Acked);
        assert_eq!(o.exchange_order_id.as_deref(), Some("X1"));

        let o = o
            .apply(&OrderEvent::PartialFill { filled_qty_base: 60, avg_price_quote: 100 })
            .unwrap();
        assert_eq!(o.status, OrderStatus::Partial);
        assert_eq!(o.filled_quantity_base, 60);

        let o = o.apply(&OrderEvent::Fill { filled_qty_base: 40, avg_price_quote: 102 }).unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.filled_quantity_base, 100);
        assert_eq!(o.avg_fill_price_quote, Some(102));

        // Terminal: any further event is a structured error.
        let err = o.apply(&OrderEvent::Cancel { reason: "late".into() }).unwrap_err();
        assert!(matches!(err, TransitionError::Terminal { .. }));
    }

    #[test]
    fn test_every_transition_is_in_the_table() {
        let o = order();
        let history = [
            (OrderEvent::Submit, OrderStatus::Submitted),
            (OrderEvent::Ack { exchange_order_id: "X".into() }, OrderStatus::Acked),
            (
                OrderEvent::PartialFill { filled_qty_base: 10, avg_price_quote: 1 },
                OrderStatus::Partial,
            ),
            (
                OrderEvent::PartialFill { filled_qty_base: 10, avg_price_quote: 1 },
                OrderStatus::Partial,
            ),
            (OrderEvent::Fill { filled_qty_base: 80, avg_price_quote: 1 }, OrderStatus::Filled),
        ];
        let mut current = o;
        for (event, expected) in history {
            let from = current.status;
            current = current.apply(&event).unwrap();
            assert!(allowed_transitions(from).contains(&current.status));
            assert_eq!(current.status, expected);
        }
    }

    #[test]
    fn test_cancel_from_submitted_is_valid() {
        let o = order().apply(&OrderEvent::Submit).unwrap();
        let o = o.apply(&OrderEvent::Cancel { reason: "operator".into() }).unwrap();
        assert_eq!(o.status, OrderStatus::Canceled);
        assert_eq!(o.cancel_reason.as_deref(), Some("operator"));
    }

    #[test]
    fn test_fill_from_created_rejected() {
        let err = order()
            .apply(&OrderEvent::Fill { filled_qty_base: 100, avg_price_quote: 1 })
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { from: OrderStatus::Created, .. }));
    }

    #[test]
    fn test_overfill_rejected() {
        let o = order()
            .apply(&OrderEvent::Submit)
            .unwrap()
            .apply(&OrderEvent::Ack { exchange_order_id: "X".into() })
            .unwrap();
        let err = o
            .apply(&OrderEvent::PartialFill { filled_qty_base: 150, avg_price_quote: 1 })
            .unwrap_err();
        assert!(matches!(err, TransitionError::OverFill { .. }));

        let err = o.apply(&OrderEvent::Fill { filled_qty_base: 101, avg_price_quote: 1 }).unwrap_err();
        assert!(matches!(err, TransitionError::OverFill { .. }));
    }

    #[test]
    fn test_short_final_fill_rejected() {
        let o = order()
            .apply(&OrderEvent::Submit)
            .unwrap()
            .apply(&OrderEvent::Ack { exchange_order_id: "X".into() })
            .unwrap();
        let err = o.apply(&OrderEvent::Fill { filled_qty_base: 99, avg_price_quote: 1 }).unwrap_err();
        assert!(matches!(err, TransitionError::ShortFill { .. }));
    }

    #[test]
    fn test_timeout_maps_to_canceled_with_note() {
        let o = order().apply(&OrderEvent::Submit).unwrap();
        let o = o.apply(&OrderEvent::Timeout { reason: "ack deadline".into() }).unwrap();
        assert_eq!(o.status, OrderStatus::Canceled);
        assert_eq!(o.cancel_reason.as_deref(), Some("timeout: ack deadline"));
    }

    #[test]
    fn test_filled_iff_complete() {
        let o = order()
            .apply(&OrderEvent::Submit)
            .unwrap()
            .apply(&OrderEvent::Ack { exchange_order_id: "X".into() })
            .unwrap()
            .apply(&OrderEvent::PartialFill { filled_qty_base: 40, avg_price_quote: 2 })
            .unwrap();
        assert!(o.filled_quantity_base < o.quantity_base);
        // A partial fill may not silently complete the order.
        let err = o
            .apply(&OrderEvent::PartialFill { filled_qty_base: 60, avg_price_quote: 2 })
            .unwrap_err();
        assert!(matches!(err, TransitionError::OverFill { .. }));
        let o = o.apply(&OrderEvent::Fill { filled_qty_base: 60, avg_price_quote: 2 }).unwrap();
        assert_eq!(o.filled_quantity_base, o.quantity_base);
        assert_eq!(o.status, OrderStatus::Filled);
    }
}
