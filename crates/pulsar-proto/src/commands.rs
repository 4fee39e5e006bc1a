//! Protobuf command structures.
//!
//! Only the commands a producer emits (`Connect`, `Producer`, `Send`, `Ping`,
//! `Pong`) and handles (`Connected`, `ProducerSuccess`, `SendReceipt`,
//! `SendError`, `Ping`, `Pong`, `CloseProducer`) are modelled. Field tags
//! mirror `PulsarApi.proto`; unknown fields on the wire are skipped by prost.

/// Discriminated envelope for every protocol command.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BaseCommand {
    #[prost(enumeration = "base_command::Type", required, tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub connect: ::core::option::Option<CommandConnect>,
    #[prost(message, optional, tag = "3")]
    pub connected: ::core::option::Option<CommandConnected>,
    #[prost(message, optional, tag = "5")]
    pub producer: ::core::option::Option<CommandProducer>,
    #[prost(message, optional, tag = "6")]
    pub send: ::core::option::Option<CommandSend>,
    #[prost(message, optional, tag = "7")]
    pub send_receipt: ::core::option::Option<CommandSendReceipt>,
    #[prost(message, optional, tag = "8")]
    pub send_error: ::core::option::Option<CommandSendError>,
    #[prost(message, optional, tag = "15")]
    pub close_producer: ::core::option::Option<CommandCloseProducer>,
    #[prost(message, optional, tag = "17")]
    pub producer_success: ::core::option::Option<CommandProducerSuccess>,
    #[prost(message, optional, tag = "18")]
    pub ping: ::core::option::Option<CommandPing>,
    #[prost(message, optional, tag = "19")]
    pub pong: ::core::option::Option<CommandPong>,
}

pub mod base_command {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Type {
        Connect = 2,
        Connected = 3,
        Producer = 5,
        Send = 6,
        SendReceipt = 7,
        SendError = 8,
        CloseProducer = 15,
        ProducerSuccess = 17,
        Ping = 18,
        Pong = 19,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandConnect {
    #[prost(string, required, tag = "1")]
    pub client_version: ::prost::alloc::string::String,
    #[prost(int32, optional, tag = "4")]
    pub protocol_version: ::core::option::Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandConnected {
    #[prost(string, required, tag = "1")]
    pub server_version: ::prost::alloc::string::String,
    #[prost(int32, optional, tag = "2")]
    pub protocol_version: ::core::option::Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub max_message_size: ::core::option::Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandProducer {
    #[prost(string, required, tag = "1")]
    pub topic: ::prost::alloc::string::String,
    #[prost(uint64, required, tag = "2")]
    pub producer_id: u64,
    #[prost(uint64, required, tag = "3")]
    pub request_id: u64,
    /// Absent on first registration; the broker assigns one.
    #[prost(string, optional, tag = "4")]
    pub producer_name: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandProducerSuccess {
    #[prost(uint64, required, tag = "1")]
    pub request_id: u64,
    #[prost(string, required, tag = "2")]
    pub producer_name: ::prost::alloc::string::String,
    #[prost(int64, optional, tag = "3", default = "-1")]
    pub last_sequence_id: ::core::option::Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandSend {
    #[prost(uint64, required, tag = "1")]
    pub producer_id: u64,
    #[prost(uint64, required, tag = "2")]
    pub sequence_id: u64,
    #[prost(int32, optional, tag = "3", default = "1")]
    pub num_messages: ::core::option::Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandSendReceipt {
    #[prost(uint64, required, tag = "1")]
    pub producer_id: u64,
    #[prost(uint64, required, tag = "2")]
    pub sequence_id: u64,
    #[prost(message, optional, tag = "3")]
    pub message_id: ::core::option::Option<MessageIdData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandSendError {
    #[prost(uint64, required, tag = "1")]
    pub producer_id: u64,
    #[prost(uint64, required, tag = "2")]
    pub sequence_id: u64,
    #[prost(string, required, tag = "4")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandCloseProducer {
    #[prost(uint64, required, tag = "1")]
    pub producer_id: u64,
    #[prost(uint64, required, tag = "2")]
    pub request_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandPing {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandPong {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageIdData {
    #[prost(uint64, required, tag = "1")]
    pub ledger_id: u64,
    #[prost(uint64, required, tag = "2")]
    pub entry_id: u64,
    #[prost(int32, optional, tag = "3", default = "-1")]
    pub partition: ::core::option::Option<i32>,
    #[prost(int32, optional, tag = "4", default = "-1")]
    pub batch_index: ::core::option::Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyValue {
    #[prost(string, required, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, required, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

/// Metadata for a whole send frame (single message or batch envelope).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageMetadata {
    #[prost(string, required, tag = "1")]
    pub producer_name: ::prost::alloc::string::String,
    #[prost(uint64, required, tag = "2")]
    pub sequence_id: u64,
    #[prost(uint64, required, tag = "3")]
    pub publish_time: u64,
    #[prost(message, repeated, tag = "4")]
    pub properties: ::prost::alloc::vec::Vec<KeyValue>,
    #[prost(string, optional, tag = "6")]
    pub partition_key: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(int32, optional, tag = "11", default = "1")]
    pub num_messages_in_batch: ::core::option::Option<i32>,
    #[prost(uint64, optional, tag = "12")]
    pub event_time: ::core::option::Option<u64>,
}

/// Per-message metadata inside a batched payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleMessageMetadata {
    #[prost(message, repeated, tag = "1")]
    pub properties: ::prost::alloc::vec::Vec<KeyValue>,
    #[prost(string, optional, tag = "2")]
    pub partition_key: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(int32, required, tag = "3")]
    pub payload_size: i32,
    #[prost(uint64, optional, tag = "5")]
    pub event_time: ::core::option::Option<u64>,
}

impl BaseCommand {
    fn bare(r#type: base_command::Type) -> Self {
        Self {
            r#type: r#type as i32,
            ..Default::default()
        }
    }

    /// `Connect` carrying this client's version strings.
    pub fn connect() -> Self {
        Self {
            connect: Some(CommandConnect {
                client_version: crate::CLIENT_VERSION.to_string(),
                protocol_version: Some(crate::PROTOCOL_VERSION),
            }),
            ..Self::bare(base_command::Type::Connect)
        }
    }

    /// `Producer` registration for a topic.
    pub fn producer(topic: impl Into<String>, producer_id: u64, request_id: u64) -> Self {
        Self {
            producer: Some(CommandProducer {
                topic: topic.into(),
                producer_id,
                request_id,
                producer_name: None,
            }),
            ..Self::bare(base_command::Type::Producer)
        }
    }

    /// `Send` announcing a batch of `num_messages` under one sequence id.
    pub fn send(producer_id: u64, sequence_id: u64, num_messages: i32) -> Self {
        Self {
            send: Some(CommandSend {
                producer_id,
                sequence_id,
                num_messages: Some(num_messages),
            }),
            ..Self::bare(base_command::Type::Send)
        }
    }

    pub fn ping() -> Self {
        Self {
            ping: Some(CommandPing {}),
            ..Self::bare(base_command::Type::Ping)
        }
    }

    pub fn pong() -> Self {
        Self {
            pong: Some(CommandPong {}),
            ..Self::bare(base_command::Type::Pong)
        }
    }

    /// Broker-side `Connected` handshake reply.
    pub fn connected(server_version: impl Into<String>) -> Self {
        Self {
            connected: Some(CommandConnected {
                server_version: server_version.into(),
                protocol_version: Some(crate::PROTOCOL_VERSION),
                max_message_size: None,
            }),
            ..Self::bare(base_command::Type::Connected)
        }
    }

    /// Broker-side `ProducerSuccess` carrying the assigned producer name.
    pub fn producer_success(request_id: u64, producer_name: impl Into<String>) -> Self {
        Self {
            producer_success: Some(CommandProducerSuccess {
                request_id,
                producer_name: producer_name.into(),
                last_sequence_id: None,
            }),
            ..Self::bare(base_command::Type::ProducerSuccess)
        }
    }

    /// Broker-side `SendReceipt` confirming a sequence id.
    pub fn send_receipt(producer_id: u64, sequence_id: u64) -> Self {
        Self {
            send_receipt: Some(CommandSendReceipt {
                producer_id,
                sequence_id,
                message_id: Some(MessageIdData {
                    ledger_id: 0,
                    entry_id: sequence_id,
                    partition: None,
                    batch_index: None,
                }),
            }),
            ..Self::bare(base_command::Type::SendReceipt)
        }
    }

    /// Broker-side `CloseProducer`.
    pub fn close_producer(producer_id: u64, request_id: u64) -> Self {
        Self {
            close_producer: Some(CommandCloseProducer {
                producer_id,
                request_id,
            }),
            ..Self::bare(base_command::Type::CloseProducer)
        }
    }

    /// The command type, if it is one this client understands.
    pub fn command_type(&self) -> Option<base_command::Type> {
        base_command::Type::try_from(self.r#type).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn connect_carries_versions() {
        let cmd = BaseCommand::connect();
        assert_eq!(cmd.command_type(), Some(base_command::Type::Connect));
        let connect = cmd.connect.unwrap();
        assert!(connect.client_version.starts_with("pulsar-spool-"));
        assert_eq!(connect.protocol_version, Some(crate::PROTOCOL_VERSION));
    }

    #[test]
    fn command_roundtrip() {
        let cmds = vec![
            BaseCommand::connect(),
            BaseCommand::producer("persistent://public/default/t-partition-0", 7, 1),
            BaseCommand::send(7, 42, 3),
            BaseCommand::ping(),
            BaseCommand::pong(),
        ];
        for cmd in cmds {
            let bytes = cmd.encode_to_vec();
            let decoded = BaseCommand::decode(bytes.as_slice()).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn unknown_type_is_none() {
        let cmd = BaseCommand {
            r#type: 999,
            ..Default::default()
        };
        assert_eq!(cmd.command_type(), None);
    }
}
