#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address as a URI, e.g. `tcp://127.0.0.1:6379`.
    pub listen: String,
    /// Snapshot debounce in ms. `0` saves synchronously on every write,
    /// negative disables persistence entirely.
    pub persist_after: i64,
    /// Passivation idle time in ms. `0` disables passivation.
    pub sleep_after: u64,
    /// HyperLogLog register-count exponent (registers = 2^register_log).
    pub register_log: u8,
    /// HyperLogLog register width in bits.
    pub register_width: u8,
    /// Keyspace partitions per node.
    pub keynodes: usize,
    /// This node's id within the static topology.
    pub node: String,
    /// Static topology: (node id, URI) pairs.
    pub nodes: Vec<(String, String)>,
    /// Snapshot directory.
    pub dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "tcp://127.0.0.1:6379".to_string(),
            persist_after: 1000,
            sleep_after: 0,
            register_log: 11,
            register_width: 6,
            keynodes: 4,
            node: String::new(),
            nodes: Vec::new(),
            dir: ".".to_string(),
        }
    }
}

impl Config {
    pub fn from_args(args: &[String]) -> Self {
        let mut config = Config::default();
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args.get(i + 1);
            match (flag, value) {
                ("--listen", Some(v)) => {
                    config.listen = v.clone();
                    i += 1;
                }
                ("--persist-after", Some(v)) => {
                    if let Ok(ms) = v.parse() {
                        config.persist_after = ms;
                    }
                    i += 1;
                }
                ("--sleep-after", Some(v)) => {
                    if let Ok(ms) = v.parse() {
                        config.sleep_after = ms;
                    }
                    i += 1;
                }
                ("--register-log", Some(v)) => {
                    if let Ok(n) = v.parse() {
                        config.register_log = n;
                    }
                    i += 1;
                }
                ("--register-width", Some(v)) => {
                    if let Ok(n) = v.parse() {
                        config.register_width = n;
                    }
                    i += 1;
                }
                ("--keynodes", Some(v)) => {
                    if let Ok(n) = v.parse() {
                        config.keynodes = n;
                    }
                    i += 1;
                }
                ("--node", Some(v)) => {
                    config.node = v.clone();
                    i += 1;
                }
                ("--nodes", Some(v)) => {
                    config.nodes = v
                        .split(',')
                        .filter_map(|pair| {
                            pair.split_once('=')
                                .map(|(id, uri)| (id.to_string(), uri.to_string()))
                        })
                        .collect();
                    i += 1;
                }
                ("--dir", Some(v)) => {
                    config.dir = v.clone();
                    i += 1;
                }
                _ => {}
            }
            i += 1;
        }
        config
    }

    /// Total partition count across the topology.
    pub fn partitions(&self) -> usize {
        self.nodes.len().max(1) * self.keynodes.max(1)
    }

    /// Host and port from the listen URI.
    pub fn bind_addr(&self) -> (String, u16) {
        let rest = self
            .listen
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.listen);
        match rest.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().unwrap_or(6379),
            ),
            None => (rest.to_string(), 6379),
        }
    }
}
