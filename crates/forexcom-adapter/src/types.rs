//! Domain types for FOREX.com trading data
//!
//! # Design Principles
//! 1. Decimal amounts stay `String` to preserve precision (no f64 round trip)
//! 2. Status-like enums map every wire value: unrecognized names and ids
//!    land on `Unknown` instead of failing the whole record
//! 3. Records are built from decoded streaming updates; a record that
//!    cannot be built is reported as `StreamError::Malformed`
//!
//! # Timestamps
//! The trading API encodes instants as `/Date(<millis since epoch>)/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::lightstream::UpdateEvent;

// ============================================================================
// Wire-name enums
// ============================================================================

/// Enum with a numeric wire id, a wire name and an `Unknown` fallback
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $id:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            #[default]
            Unknown,
            $($variant),+
        }

        impl $name {
            /// Match a wire name, ignoring case and spaces
            pub fn from_wire_name(name: &str) -> Self {
                let wanted: String =
                    name.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase();
                match wanted.as_str() {
                    $(n if n == stringify!($variant).to_uppercase() => $name::$variant,)+
                    _ => $name::Unknown,
                }
            }

            pub fn from_id(id: i64) -> Self {
                match id {
                    $($id => $name::$variant,)+
                    _ => $name::Unknown,
                }
            }

            pub fn id(&self) -> i64 {
                match self {
                    $name::Unknown => 0,
                    $($name::$variant => $id,)+
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $name::Unknown => "Unknown",
                    $($name::$variant => stringify!($variant),)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// Order type (Trade / Stop / Limit)
    OrderType { Trade = 1, Stop = 2, Limit = 3 }
}

wire_enum! {
    OrderStatus {
        Pending = 1,
        Accepted = 2,
        Open = 3,
        Cancelled = 4,
        Rejected = 5,
        Suspended = 6,
        YellowCard = 8,
        Closed = 9,
        RedCard = 10,
        Triggered = 11,
    }
}

wire_enum! {
    /// What an order action did to a position
    OrderActionType {
        OpeningOrder = 1,
        FullClose = 2,
        PartClose = 3,
        QuantityDecrease = 4,
        QuantityIncrease = 5,
        AddOrder = 6,
        RolledOrder = 7,
        CancelledOrder = 8,
    }
}

wire_enum! {
    QuoteStatus { Pending = 1, Accepted = 2, Rejected = 3, Closed = 4, Error = 5, RedCard = 6 }
}

wire_enum! {
    /// Account and instrument currencies by trading API id
    #[allow(clippy::upper_case_acronyms)]
    Currency {
        AUD = 1, CAD = 2, CHF = 3, EUR = 4, GBP = 6, HKD = 7, JPY = 8, SEK = 9,
        SGD = 10, USD = 11, ZAR = 12, DKK = 14, IDR = 15, KRW = 16, MXN = 17,
        MYR = 18, NOK = 19, NZD = 20, THB = 21, TWD = 22, INR = 23, PLN = 24,
        TRY = 31, CZK = 32, HUF = 33, SKK = 34, CNH = 36, AED = 37, BRL = 38,
        ILS = 39, RON = 40, RUB = 41, SAR = 42, XAU = 43, XAG = 44, CNY = 45,
    }
}

// ============================================================================
// Plain enums
// ============================================================================

/// Outcome of a REST instruction (`StatusCode`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionStatus {
    Accepted,
    RedCard,
    YellowCard,
    Error,
    Pending,
}

impl InstructionStatus {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::Accepted),
            2 => Some(Self::RedCard),
            3 => Some(Self::YellowCard),
            4 => Some(Self::Error),
            5 => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Side of an order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Sell,
    Buy,
}

impl Position {
    /// Streaming `Direction` field: `1` is a buy, anything else a sell
    pub fn from_direction(direction: i64) -> Self {
        if direction == 1 {
            Position::Buy
        } else {
            Position::Sell
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionMethod {
    LongOrShortOnly,
    LongAndShort,
}

impl PositionMethod {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::LongOrShortOnly),
            2 => Some(Self::LongAndShort),
            _ => None,
        }
    }
}

// ============================================================================
// Field helpers
// ============================================================================

/// Parse `/Date(<millis>)/`; an offset suffix such as `+0000` is ignored
pub fn parse_wire_date(raw: &str) -> Option<DateTime<Utc>> {
    let start = raw.find("Date(")? + "Date(".len();
    let rest = &raw[start..];
    let end = rest
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && *c == '-')))
        .map_or(rest.len(), |(i, _)| i);
    let millis: i64 = rest[..end].parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}

fn required<'a>(event: &'a UpdateEvent, field: &str) -> Result<&'a str> {
    event.get(field).ok_or_else(|| {
        StreamError::Malformed(format!("{} missing in update of table {}", field, event.handle))
    })
}

fn text(event: &UpdateEvent, field: &str) -> String {
    event.get(field).unwrap_or_default().to_string()
}

fn integer(event: &UpdateEvent, field: &str) -> Result<i64> {
    let raw = required(event, field)?;
    raw.trim()
        .parse()
        .map_err(|_| StreamError::Malformed(format!("{} is not an integer: {}", field, raw)))
}

fn date(event: &UpdateEvent, field: &str) -> Result<DateTime<Utc>> {
    let raw = required(event, field)?;
    parse_wire_date(raw)
        .ok_or_else(|| StreamError::Malformed(format!("{} is not a date: {}", field, raw)))
}

fn flag(event: &UpdateEvent, field: &str) -> bool {
    matches!(event.get(field).map(|v| v.trim().to_ascii_lowercase()).as_deref(), Some("true" | "1"))
}

// ============================================================================
// Prices
// ============================================================================

/// Field list of a price subscription, in schema order
pub const PRICE_FIELDS: [&str; 11] = [
    "MarketId",
    "TickDate",
    "Bid",
    "Offer",
    "Price",
    "High",
    "Low",
    "Change",
    "Direction",
    "AuditId",
    "StatusSummary",
];

/// One price tick of a market
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub symbol_id: i64,
    /// Market name when it is already known to the resolver
    pub symbol_name: Option<String>,
    pub tick_datetime: DateTime<Utc>,
    pub bid: String,
    pub offer: String,
    pub price: String,
    pub high: String,
    pub low: String,
    pub change: String,
    /// Movement since the last tick: +1 up, -1 down
    pub direction: i8,
    /// Unique per tick, treat as opaque
    pub audit_id: String,
    /// 0 = Normal, 1 = Indicative, 2 = PhoneOnly, 3 = Suspended, 4 = Closed
    pub status_summary: String,
}

impl Price {
    pub fn from_update(event: &UpdateEvent, symbol_name: Option<String>) -> Result<Self> {
        Ok(Self {
            symbol_id: integer(event, "MarketId")?,
            symbol_name,
            tick_datetime: date(event, "TickDate")?,
            bid: text(event, "Bid"),
            offer: text(event, "Offer"),
            price: text(event, "Price"),
            high: text(event, "High"),
            low: text(event, "Low"),
            change: text(event, "Change"),
            direction: if event.get("Direction").map(str::trim) == Some("1") { 1 } else { -1 },
            audit_id: text(event, "AuditId"),
            status_summary: text(event, "StatusSummary"),
        })
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | {} | {} | {} | {} | {}",
            self.tick_datetime,
            self.symbol_name.as_deref().unwrap_or("?"),
            self.bid,
            self.offer,
            self.change,
            self.direction
        )
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Field list of the ORDERS subscription, in schema order
pub const ORDER_FIELDS: [&str; 18] = [
    "OrderId",
    "MarketId",
    "ClientAccountId",
    "TradingAccountId",
    "CurrencyId",
    "CurrencyISO",
    "Direction",
    "AutoRollover",
    "ExecutionPrice",
    "LastChangedTime",
    "OpenPrice",
    "OriginalLastChangedDateTime",
    "OriginalQuantity",
    "PositionMethodId",
    "Quantity",
    "Type",
    "Status",
    "ReasonId",
];

/// Order state pushed on the ORDERS channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub symbol_id: i64,
    pub symbol_name: Option<String>,
    pub client_account_id: i64,
    pub trading_account_id: i64,
    pub currency: Currency,
    pub position: Position,
    pub auto_rollover: bool,
    pub execution_price: String,
    pub open_price: String,
    pub last_changed_time: DateTime<Utc>,
    pub original_last_changed_date_time: DateTime<Utc>,
    pub original_quantity: String,
    pub position_method: PositionMethod,
    pub quantity: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub reason_id: i64,
}

impl Order {
    pub fn from_update(event: &UpdateEvent, symbol_name: Option<String>) -> Result<Self> {
        let method_id = integer(event, "PositionMethodId")?;
        let position_method = PositionMethod::from_id(method_id).ok_or_else(|| {
            StreamError::Malformed(format!("unknown PositionMethodId {}", method_id))
        })?;

        Ok(Self {
            order_id: integer(event, "OrderId")?,
            symbol_id: integer(event, "MarketId")?,
            symbol_name,
            client_account_id: integer(event, "ClientAccountId")?,
            trading_account_id: integer(event, "TradingAccountId")?,
            currency: Currency::from_id(integer(event, "CurrencyId")?),
            position: Position::from_direction(integer(event, "Direction")?),
            auto_rollover: flag(event, "AutoRollover"),
            execution_price: text(event, "ExecutionPrice"),
            open_price: text(event, "OpenPrice"),
            last_changed_time: date(event, "LastChangedTime")?,
            original_last_changed_date_time: date(event, "OriginalLastChangedDateTime")?,
            original_quantity: text(event, "OriginalQuantity"),
            position_method,
            quantity: text(event, "Quantity"),
            order_type: OrderType::from_wire_name(&text(event, "Type")),
            status: OrderStatus::from_wire_name(&text(event, "Status")),
            reason_id: integer(event, "ReasonId")?,
        })
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | {} | {} | {:?} | {:?} | {} | {} | {} | {} | {} | {} | {}",
            self.last_changed_time,
            self.order_id,
            self.symbol_name.as_deref().unwrap_or("?"),
            self.position,
            self.position_method,
            self.order_type,
            self.status,
            self.reason_id,
            self.open_price,
            self.execution_price,
            self.original_quantity,
            self.quantity
        )
    }
}
