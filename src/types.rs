//! Shared classification types and the timestamp codec
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_else(Utc::now)
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Nanoseconds since the epoch, used for time-ordered store keys
    pub fn nanos(&self) -> i64 {
        self.0.timestamp_nanos_opt().unwrap_or_default()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl Serialize for TimeStamp<Utc> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

/// Supported advertising platforms
#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[n(0)]
    Facebook,
    #[n(1)]
    Google,
    #[n(2)]
    TikTok,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Facebook, Platform::Google, Platform::TikTok];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Google => "google",
            Platform::TikTok => "tiktok",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "facebook" | "fb" | "meta" => Ok(Platform::Facebook),
            "google" => Ok(Platform::Google),
            "tiktok" => Ok(Platform::TikTok),
            other => Err(format!("unsupported platform '{other}'")),
        }
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderType {
    #[n(0)]
    AccountApplication,
    #[n(1)]
    AccountManagement,
    #[n(2)]
    Payment,
    #[n(3)]
    AttachmentManagement,
}

impl WorkOrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderType::AccountApplication => "ACCOUNT_APPLICATION",
            WorkOrderType::AccountManagement => "ACCOUNT_MANAGEMENT",
            WorkOrderType::Payment => "PAYMENT",
            WorkOrderType::AttachmentManagement => "ATTACHMENT_MANAGEMENT",
        }
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderSubtype {
    #[n(0)]
    Deposit,
    #[n(1)]
    Withdrawal,
    #[n(2)]
    Transfer,
    #[n(3)]
    BindAccount,
    #[n(4)]
    UnbindAccount,
    #[n(5)]
    BindEmail,
    #[n(6)]
    UnbindEmail,
    #[n(7)]
    BindPixel,
    #[n(8)]
    UnbindPixel,
    #[n(9)]
    Zeroing,
    #[n(10)]
    AccountNameUpdate,
    #[n(11)]
    FacebookAccount,
    #[n(12)]
    GoogleAccount,
    #[n(13)]
    TiktokAccount,
}

impl WorkOrderSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderSubtype::Deposit => "DEPOSIT",
            WorkOrderSubtype::Withdrawal => "WITHDRAWAL",
            WorkOrderSubtype::Transfer => "TRANSFER",
            WorkOrderSubtype::BindAccount => "BIND_ACCOUNT",
            WorkOrderSubtype::UnbindAccount => "UNBIND_ACCOUNT",
            WorkOrderSubtype::BindEmail => "BIND_EMAIL",
            WorkOrderSubtype::UnbindEmail => "UNBIND_EMAIL",
            WorkOrderSubtype::BindPixel => "BIND_PIXEL",
            WorkOrderSubtype::UnbindPixel => "UNBIND_PIXEL",
            WorkOrderSubtype::Zeroing => "ZEROING",
            WorkOrderSubtype::AccountNameUpdate => "ACCOUNT_NAME_UPDATE",
            WorkOrderSubtype::FacebookAccount => "FACEBOOK_ACCOUNT",
            WorkOrderSubtype::GoogleAccount => "GOOGLE_ACCOUNT",
            WorkOrderSubtype::TiktokAccount => "TIKTOK_ACCOUNT",
        }
    }
}

impl fmt::Display for WorkOrderSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkOrderSubtype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.to_ascii_uppercase().as_str() {
            "DEPOSIT" => WorkOrderSubtype::Deposit,
            "WITHDRAWAL" => WorkOrderSubtype::Withdrawal,
            "TRANSFER" => WorkOrderSubtype::Transfer,
            "BIND_ACCOUNT" => WorkOrderSubtype::BindAccount,
            "UNBIND_ACCOUNT" => WorkOrderSubtype::UnbindAccount,
            "BIND_EMAIL" => WorkOrderSubtype::BindEmail,
            "UNBIND_EMAIL" => WorkOrderSubtype::UnbindEmail,
            "BIND_PIXEL" => WorkOrderSubtype::BindPixel,
            "UNBIND_PIXEL" => WorkOrderSubtype::UnbindPixel,
            "ZEROING" => WorkOrderSubtype::Zeroing,
            "ACCOUNT_NAME_UPDATE" => WorkOrderSubtype::AccountNameUpdate,
            "FACEBOOK_ACCOUNT" => WorkOrderSubtype::FacebookAccount,
            "GOOGLE_ACCOUNT" => WorkOrderSubtype::GoogleAccount,
            "TIKTOK_ACCOUNT" => WorkOrderSubtype::TiktokAccount,
            other => return Err(format!("unknown work order subtype '{other}'")),
        };
        Ok(parsed)
    }
}
