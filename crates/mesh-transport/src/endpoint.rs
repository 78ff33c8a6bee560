use mesh_error::{ErrorCode, MeshError};

/// `host` or `host:port`, per the external interfaces section. Default port
/// is deployment-configurable, so callers supply it explicitly when an
/// endpoint string omits one.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(s: &str, default_port: u16) -> Result<Self, MeshError> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    MeshError::server(
                        ErrorCode::InvalidArgument,
                        format!("invalid endpoint string: {s}"),
                    )
                })?;
                Ok(Self { host: host.to_string(), port })
            }
            _ => Ok(Self { host: s.to_string(), port: default_port }),
        }
    }

    pub fn to_socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Given a non-empty list of endpoints and a requested count, produce the
/// smallest multiple-of-`|E|` list (≥ `n`, ≥ `|E|`) by round-robin
/// repetition (§4.D.2).
pub fn expand(n: usize, endpoints: &[Endpoint]) -> Vec<Endpoint> {
    assert!(!endpoints.is_empty(), "endpoint list must be non-empty");
    let target_len = n.max(endpoints.len());
    let multiples = target_len.div_ceil(endpoints.len());
    let total = multiples * endpoints.len();
    (0..total).map(|i| endpoints[i % endpoints.len()].clone()).collect()
}
