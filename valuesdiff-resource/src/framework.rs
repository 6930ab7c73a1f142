use std::{
    io::{BufRead, BufReader, Write},
    os::fd::{AsRawFd, FromRawFd},
};

use anyhow::{bail, Context, Result};
use nix::unistd::{dup, dup2};

use crate::schema::v0::{
    self, CreateResourceRequest, CreateResourceResponse, DestroyResourceRequest,
    DestroyResourceResponse, PlanResourceRequest, PlanResourceResponse, UpdateResourceRequest,
    UpdateResourceResponse,
};

pub trait ResourceProvider {
    fn create(&self, request: CreateResourceRequest) -> Result<CreateResourceResponse>;
    fn update(&self, request: UpdateResourceRequest) -> Result<UpdateResourceResponse>;
    /// Dry run of [`create`](Self::create) or [`update`](Self::update).
    fn plan(&self, request: PlanResourceRequest) -> Result<PlanResourceResponse>;

    /// Providers whose resources only live in the host's state have nothing to
    /// clean up.
    fn destroy(&self, _request: DestroyResourceRequest) -> Result<DestroyResourceResponse> {
        Ok(DestroyResourceResponse {})
    }

    /// A stable classification of `error`, reported next to its message.
    fn error_kind(&self, _error: &anyhow::Error) -> Option<String> {
        None
    }
}

/// Dispatch a single request. Provider errors become an
/// [`v0::Response::ErrorResponse`].
pub fn handle_request(provider: &impl ResourceProvider, request: v0::Request) -> v0::Response {
    let result = match request {
        v0::Request::CreateResourceRequest(r) => provider
            .create(r)
            .with_context(|| "Could not create resource")
            .map(v0::Response::CreateResourceResponse),
        v0::Request::UpdateResourceRequest(r) => provider
            .update(r)
            .with_context(|| "Could not update resource")
            .map(v0::Response::UpdateResourceResponse),
        v0::Request::PlanResourceRequest(r) => provider
            .plan(r)
            .with_context(|| "Could not plan resource")
            .map(v0::Response::PlanResourceResponse),
        v0::Request::DestroyResourceRequest(r) => provider
            .destroy(r)
            .with_context(|| "Could not destroy resource")
            .map(v0::Response::DestroyResourceResponse),
    };
    result.unwrap_or_else(|e| {
        tracing::error!("{:?}", e);
        v0::Response::ErrorResponse(v0::ErrorResponse {
            kind: provider.error_kind(&e),
            message: format!("{:#}", e),
        })
    })
}

/// Read one request line from `in_`, and write the response line to `out`.
pub fn serve(
    provider: &impl ResourceProvider,
    mut in_: impl BufRead,
    mut out: impl Write,
) -> Result<v0::Response> {
    let request: v0::Request = {
        let mut line = String::new();
        let n = in_
            .read_line(&mut line)
            .with_context(|| "Could not read line for request message")?;
        if n == 0 {
            bail!("No request message received");
        }
        serde_json::from_str(&line).with_context(|| "Could not parse request message")?
    };

    let response = handle_request(provider, request);

    serde_json::to_writer(&mut out, &response)
        .with_context(|| "Could not write response message")?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(response)
}

pub fn run_main(provider: impl ResourceProvider) {
    let pipe = init_stdio()
        .map(pipe_fds_to_files)
        .unwrap_or_exit();

    let response = serve(&provider, BufReader::new(pipe.in_), pipe.out).unwrap_or_exit();
    if let v0::Response::ErrorResponse(_) = response {
        std::process::exit(1);
    }
}

/// A pair of `T` values: one for input and one for output.
struct InOut<T> {
    in_: T,
    out: T,
}

/// A file descriptor
type Fd = i32;

/// Configure the standard input/output streams for the process.
/// This returns the communication channels with the host, and reconfigures the
/// stdio file descriptors as follows:
///
/// ```text
/// 0: /dev/null
/// 1: stderr
/// 2: stderr
/// ```
fn init_stdio() -> Result<InOut<Fd>> {
    let r = InOut {
        in_: dup(0).with_context(|| "dup(0)")?,
        out: dup(1).with_context(|| "dup(1)")?,
    };

    // 0: dev/null
    {
        let dev_null =
            std::fs::File::open("/dev/null").with_context(|| "Could not open /dev/null")?;
        dup2(dev_null.as_raw_fd(), 0).with_context(|| "Could not dup2(/dev/null, 0)")?;
    }

    // 1: stderr
    dup2(2, 1).with_context(|| "Could not dup2(2, 1)")?;

    // 2: stderr is left as is

    Ok(r)
}

fn pipe_fds_to_files(pipe: InOut<Fd>) -> InOut<std::fs::File> {
    // SAFETY: both descriptors were just returned by dup() and are owned by
    // nothing else.
    InOut {
        in_: unsafe { std::fs::File::from_raw_fd(pipe.in_) },
        out: unsafe { std::fs::File::from_raw_fd(pipe.out) },
    }
}

trait ProviderMainError<T> {
    type V;
    fn unwrap_or_exit(self) -> Self::V;
}
impl<T> ProviderMainError<Result<T>> for Result<T> {
    type V = T;
    fn unwrap_or_exit(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => {
                eprintln!("Error: {:?}", e);
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    struct EchoProvider;

    impl ResourceProvider for EchoProvider {
        fn create(&self, request: CreateResourceRequest) -> Result<CreateResourceResponse> {
            if request.type_.as_str() != "echo" {
                bail!("unknown resource type: {}", request.type_);
            }
            Ok(CreateResourceResponse {
                output_properties: v0::OutputProperties(request.input_properties.0),
            })
        }
        fn update(&self, request: UpdateResourceRequest) -> Result<UpdateResourceResponse> {
            Ok(UpdateResourceResponse {
                output_properties: v0::OutputProperties(request.input_properties.0),
            })
        }
        fn plan(&self, request: PlanResourceRequest) -> Result<PlanResourceResponse> {
            Ok(PlanResourceResponse {
                output_properties: v0::OutputProperties(request.input_properties.0),
            })
        }
        fn error_kind(&self, _error: &anyhow::Error) -> Option<String> {
            Some("EchoError".to_string())
        }
    }

    fn run(input: &str) -> (Result<v0::Response>, Value) {
        let mut out = Vec::new();
        let r = serve(&EchoProvider, input.as_bytes(), &mut out);
        let written = if out.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&out).unwrap()
        };
        (r, written)
    }

    #[test]
    fn test_serve_create() {
        let (r, written) = run(
            r#"{"CreateResourceRequest":{"type":"echo","inputProperties":{"a":1}}}
"#,
        );
        r.unwrap();
        assert_eq!(
            written,
            json!({"CreateResourceResponse": {"outputProperties": {"a": 1}}})
        );
    }

    #[test]
    fn test_serve_destroy_default() {
        let (r, written) = run(
            r#"{"DestroyResourceRequest":{"resource":{"type":"echo","inputProperties":{}}}}"#,
        );
        assert_eq!(
            r.unwrap(),
            v0::Response::DestroyResourceResponse(DestroyResourceResponse {})
        );
        assert_eq!(written, json!({"DestroyResourceResponse": {}}));
    }

    #[test]
    fn test_serve_provider_error() {
        let (r, written) = run(
            r#"{"CreateResourceRequest":{"type":"nope","inputProperties":{}}}"#,
        );
        assert!(matches!(r.unwrap(), v0::Response::ErrorResponse(_)));
        assert_eq!(
            written,
            json!({"ErrorResponse": {
                "message": "Could not create resource: unknown resource type: nope",
                "kind": "EchoError",
            }})
        );
    }

    #[test]
    fn test_serve_malformed_request() {
        let (r, written) = run("{\"CreateResourceRequest\":");
        assert!(r.is_err());
        assert_eq!(written, Value::Null);
    }

    #[test]
    fn test_serve_no_request() {
        let (r, _) = run("");
        assert_eq!(r.unwrap_err().to_string(), "No request message received");
    }

    #[test]
    fn test_handle_plan() {
        let response = handle_request(
            &EchoProvider,
            v0::Request::PlanResourceRequest(PlanResourceRequest {
                type_: v0::ResourceType("echo".to_string()),
                resource: None,
                input_properties: v0::InputProperties(Map::new()),
            }),
        );
        assert_eq!(
            response,
            v0::Response::PlanResourceResponse(PlanResourceResponse {
                output_properties: v0::OutputProperties(Map::new()),
            })
        );
    }
}
