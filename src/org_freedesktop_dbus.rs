//! Typed wrappers for the `org.freedesktop.DBus` interface.

use std::ops::BitOr;

use crate::error::{ErrorKind, Result};
use crate::message::Message;
use crate::value::Value;
use crate::Client;

/// Well known destination name.
pub const DESTINATION: &str = "org.freedesktop.DBus";

/// Well known interface name.
pub const INTERFACE: &str = "org.freedesktop.DBus";

/// Well known D-Bus path.
pub const PATH: &str = "/org/freedesktop/DBus";

/// The flags to a `RequestName` call.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct NameFlag(u32);

impl NameFlag {
    /// An empty set of flags.
    pub const EMPTY: Self = Self(0);
    /// Allow another application which specifies `REPLACE_EXISTING` to take
    /// the name over.
    pub const ALLOW_REPLACEMENT: Self = Self(1);
    /// Try to replace the current owner if there is one.
    pub const REPLACE_EXISTING: Self = Self(2);
    /// Fail the request instead of queueing when the name is taken.
    pub const DO_NOT_QUEUE: Self = Self(4);

    /// The raw flag mask.
    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0
    }
}

impl BitOr for NameFlag {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The reply to a `RequestName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    /// The caller is now the primary owner of the name.
    PrimaryOwner = 1,
    /// The name already had an owner and the caller has been queued for it.
    InQueue = 2,
    /// The name already has an owner and `DO_NOT_QUEUE` was specified.
    Exists = 3,
    /// The caller already owns the name.
    AlreadyOwner = 4,
}

impl RequestNameReply {
    fn from_raw(value: u32) -> Option<Self> {
        match value {
            1 => Some(RequestNameReply::PrimaryOwner),
            2 => Some(RequestNameReply::InQueue),
            3 => Some(RequestNameReply::Exists),
            4 => Some(RequestNameReply::AlreadyOwner),
            _ => None,
        }
    }
}

/// The reply to a `ReleaseName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    /// The caller released the name.
    Released = 1,
    /// The name does not exist on the bus.
    NonExistent = 2,
    /// The caller neither owns nor waits for the name.
    NotOwner = 3,
}

impl ReleaseNameReply {
    fn from_raw(value: u32) -> Option<Self> {
        match value {
            1 => Some(ReleaseNameReply::Released),
            2 => Some(ReleaseNameReply::NonExistent),
            3 => Some(ReleaseNameReply::NotOwner),
            _ => None,
        }
    }
}

/// The reply to a `StartServiceByName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartServiceReply {
    /// The service was started.
    Success = 1,
    /// The service was already running.
    AlreadyRunning = 2,
}

impl StartServiceReply {
    fn from_raw(value: u32) -> Option<Self> {
        match value {
            1 => Some(StartServiceReply::Success),
            2 => Some(StartServiceReply::AlreadyRunning),
            _ => None,
        }
    }
}

impl Client {
    /// Say `Hello` to the bus, which returns the unique connection name.
    ///
    /// Called once while establishing the session; the bus rejects every
    /// other method until it has been.
    pub(crate) async fn hello(&self) -> Result<String> {
        let reply = self.call_method(bus_call("Hello")).await?;
        reply_string(&reply)
    }

    /// Request ownership of the well-known `name`.
    pub async fn request_name(&self, name: &str, flags: NameFlag) -> Result<RequestNameReply> {
        let m = bus_call("RequestName")
            .with_arg(Value::Str(name.into()))
            .with_arg(Value::Uint32(flags.to_raw()));

        let reply = self.call_method(m).await?;
        RequestNameReply::from_raw(reply_u32(&reply)?).ok_or_else(|| ErrorKind::InvalidReply.into())
    }

    /// Release ownership of the well-known `name`.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        let m = bus_call("ReleaseName").with_arg(Value::Str(name.into()));
        let reply = self.call_method(m).await?;
        ReleaseNameReply::from_raw(reply_u32(&reply)?).ok_or_else(|| ErrorKind::InvalidReply.into())
    }

    /// Every name currently on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.call_method(bus_call("ListNames")).await?;
        reply_string_array(&reply)
    }

    /// Every name which can be activated on the bus.
    pub async fn list_activatable_names(&self) -> Result<Vec<String>> {
        let reply = self.call_method(bus_call("ListActivatableNames")).await?;
        reply_string_array(&reply)
    }

    /// Test if `name` has an owner.
    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        let m = bus_call("NameHasOwner").with_arg(Value::Str(name.into()));
        let reply = self.call_method(m).await?;

        reply
            .body
            .first()
            .and_then(Value::as_bool)
            .ok_or_else(|| ErrorKind::InvalidReply.into())
    }

    /// The unique name of the owner of `name`.
    pub async fn get_name_owner(&self, name: &str) -> Result<String> {
        let m = bus_call("GetNameOwner").with_arg(Value::Str(name.into()));
        let reply = self.call_method(m).await?;
        reply_string(&reply)
    }

    /// Ask the bus to start the service owning `name`. The flags argument is
    /// reserved and must be zero.
    pub async fn start_service_by_name(
        &self,
        name: &str,
        flags: u32,
    ) -> Result<StartServiceReply> {
        let m = bus_call("StartServiceByName")
            .with_arg(Value::Str(name.into()))
            .with_arg(Value::Uint32(flags));

        let reply = self.call_method(m).await?;
        StartServiceReply::from_raw(reply_u32(&reply)?).ok_or_else(|| ErrorKind::InvalidReply.into())
    }

    /// Register a match rule with the bus daemon.
    pub async fn add_match(&self, rule: &str) -> Result<()> {
        let m = bus_call("AddMatch").with_arg(Value::Str(rule.into()));
        self.call_method(m).await?;
        Ok(())
    }

    /// Remove a previously registered match rule.
    pub async fn remove_match(&self, rule: &str) -> Result<()> {
        let m = bus_call("RemoveMatch").with_arg(Value::Str(rule.into()));
        self.call_method(m).await?;
        Ok(())
    }

    /// The globally unique id of the bus.
    pub async fn get_id(&self) -> Result<String> {
        let reply = self.call_method(bus_call("GetId")).await?;
        reply_string(&reply)
    }
}

fn bus_call(member: &str) -> Message {
    Message::method_call(PATH, member)
        .with_destination(DESTINATION)
        .with_interface(INTERFACE)
}

fn reply_string(reply: &Message) -> Result<String> {
    match reply.body.first() {
        Some(Value::Str(value)) => Ok(value.clone()),
        _ => Err(ErrorKind::InvalidReply.into()),
    }
}

fn reply_u32(reply: &Message) -> Result<u32> {
    reply
        .body
        .first()
        .and_then(Value::as_u32)
        .ok_or_else(|| ErrorKind::InvalidReply.into())
}

fn reply_string_array(reply: &Message) -> Result<Vec<String>> {
    let Some(Value::Array { items, .. }) = reply.body.first() else {
        return Err(ErrorKind::InvalidReply.into());
    };

    let mut names = Vec::with_capacity(items.len());

    for item in items {
        match item {
            Value::Str(value) => names.push(value.clone()),
            _ => return Err(ErrorKind::InvalidReply.into()),
        }
    }

    Ok(names)
}
