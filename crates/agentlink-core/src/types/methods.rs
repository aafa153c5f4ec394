//! Typed method descriptors
//!
//! Each marker type ties a method name to its parameter and result payloads,
//! so payloads are validated where they cross the dispatcher boundary.

use super::protocol_types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A request method: sent with params, answered with a result
pub trait RequestMethod {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Result: Serialize + DeserializeOwned + Send + 'static;
}

/// A notification method: params only, never answered
pub trait NotificationMethod {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
}

macro_rules! request_method {
    ($(#[$meta:meta])* $name:ident, $method:literal, $params:ty, $result:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub enum $name {}

        impl RequestMethod for $name {
            const METHOD: &'static str = $method;
            type Params = $params;
            type Result = $result;
        }
    };
}

macro_rules! notification_method {
    ($(#[$meta:meta])* $name:ident, $method:literal, $params:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub enum $name {}

        impl NotificationMethod for $name {
            const METHOD: &'static str = $method;
            type Params = $params;
        }
    };
}

// Lifecycle
request_method!(
    /// Capability/version handshake
    Initialize, "initialize", ClientInfo, ServerInfo
);
request_method!(Shutdown, "shutdown", (), Value);
notification_method!(Initialized, "initialized", ());
notification_method!(Exit, "exit", ());
notification_method!(CancelRequest, "$/cancelRequest", CancelParams);

// Features
request_method!(ChatNew, "chat/new", (), String);
request_method!(
    ChatSubmitMessage,
    "chat/submitMessage",
    ChatSubmitMessageParams,
    ExtensionMessage
);
request_method!(
    AutocompleteExecute,
    "autocomplete/execute",
    AutocompleteParams,
    AutocompleteResult
);
request_method!(CommandExecute, "command/execute", ExecuteCommandParams, Value);

notification_method!(TextDocumentDidOpen, "textDocument/didOpen", ProtocolTextDocument);
notification_method!(TextDocumentDidChange, "textDocument/didChange", ProtocolTextDocument);
notification_method!(TextDocumentDidFocus, "textDocument/didFocus", ProtocolTextDocument);
notification_method!(TextDocumentDidClose, "textDocument/didClose", ProtocolTextDocument);
notification_method!(
    ExtensionConfigurationDidChange,
    "extensionConfiguration/didChange",
    ExtensionConfiguration
);

// Worker -> client
notification_method!(DebugMessageNotification, "debug/message", DebugMessage);
notification_method!(CodeLensesDisplay, "codeLenses/display", DisplayCodeLensParams);

/// Serialize params for the wire. Unit params are sent without a `params` key.
pub fn encode_params<P: Serialize>(params: &P) -> serde_json::Result<Option<Value>> {
    let value = serde_json::to_value(params)?;
    Ok(if value.is_null() { None } else { Some(value) })
}

/// Decode params received from the wire. A missing `params` key reads as `null`.
pub fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> serde_json::Result<P> {
    serde_json::from_value(params.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_params_are_omitted() {
        assert_eq!(encode_params(&()).unwrap(), None);
        let params = ExecuteCommandParams {
            command: "cody.explain".into(),
            arguments: vec![],
        };
        assert_eq!(
            encode_params(&params).unwrap(),
            Some(json!({ "command": "cody.explain" }))
        );
    }

    #[test]
    fn test_decode_missing_params_as_unit() {
        assert!(decode_params::<()>(None).is_ok());
        assert!(decode_params::<DebugMessage>(None).is_err());
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Initialize::METHOD, "initialize");
        assert_eq!(ChatSubmitMessage::METHOD, "chat/submitMessage");
        assert_eq!(DebugMessageNotification::METHOD, "debug/message");
    }
}
