//! Entity records persisted by the local store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Enum stored as a fixed text value, in SQLite and in JSON alike.
macro_rules! text_enum {
  ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
    $(#[$meta])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum $name {
      $(#[serde(rename = $text)] $variant),+
    }

    impl $name {
      pub fn as_str(self) -> &'static str {
        match self {
          $(Self::$variant => $text),+
        }
      }
    }

    impl std::str::FromStr for $name {
      type Err = Report;

      fn from_str(s: &str) -> Result<Self> {
        match s {
          $($text => Ok(Self::$variant),)+
          other => Err(eyre!("Unknown {} value: {}", stringify!($name), other)),
        }
      }
    }

    impl ToSql for $name {
      fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
      }
    }

    impl FromSql for $name {
      fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
          .as_str()?
          .parse()
          .map_err(|e: Report| FromSqlError::Other(e.into()))
      }
    }
  };
}

text_enum!(
  /// Where a business stands in its permitting process.
  ComplianceStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Approved => "approved",
    Rejected => "rejected",
  }
);

text_enum!(
  /// Document lifecycle: pending, uploaded, then validated or rejected.
  DocumentStatus {
    Pending => "pending",
    Uploaded => "uploaded",
    Validated => "validated",
    Rejected => "rejected",
  }
);

text_enum!(PermitStatus {
  Required => "required",
  Optional => "optional",
  Completed => "completed",
  Pending => "pending",
});

text_enum!(Language {
  Es => "es",
  En => "en",
});

text_enum!(Theme {
  Light => "light",
  Dark => "dark",
  System => "system",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
  pub street: String,
  pub city: String,
  pub state: String,
  pub zip: String,
  pub municipality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Business {
  pub name: String,
  pub address: Address,
  pub business_type: String,
  pub permit_status: ComplianceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  /// Owning business. Not enforced by the store; callers keep it valid.
  pub business_id: i64,
  pub filename: String,
  pub mime_type: String,
  pub size: u64,
  /// Raw payload. Left out of JSON listings.
  #[serde(default, skip_serializing)]
  pub data: Vec<u8>,
  #[serde(default)]
  pub quality_score: Option<f64>,
  #[serde(default)]
  pub issues: Vec<String>,
  pub status: DocumentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permit {
  pub business_id: i64,
  pub category: String,
  pub name: String,
  pub status: PermitStatus,
  pub description: String,
  #[serde(default)]
  pub estimated_cost: Option<f64>,
  #[serde(default)]
  pub estimated_days: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
  pub email: bool,
  pub sms: bool,
  pub push: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
  pub language: Language,
  pub theme: Theme,
  pub notifications: NotificationSettings,
  pub last_sync: Option<DateTime<Utc>>,
}

impl Default for AppSettings {
  fn default() -> Self {
    Self {
      language: Language::Es,
      theme: Theme::Light,
      notifications: NotificationSettings {
        email: true,
        sms: true,
        push: true,
      },
      last_sync: None,
    }
  }
}

/// A record as persisted: store-assigned id and timestamps around the
/// caller's data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stored<T> {
  pub id: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(flatten)]
  pub record: T,
}
