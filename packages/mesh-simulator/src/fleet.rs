//! Simulated node fleet: fixed identities, positions drifting on a ring
//! around the configured center.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const NAMES: [&str; 8] = [
    "Summit", "Ridge", "Harbor", "Quarry", "Beacon", "Orchard", "Mill", "Ferry",
];
const ROLES: [&str; 3] = ["companion", "repeater", "room server"];

// Rough degrees-per-km at mid latitudes; precision does not matter here.
const DEG_PER_KM: f64 = 1.0 / 111.0;

#[derive(Debug, Clone)]
pub struct SimNode {
    pub id: String,
    pub name: String,
    pub role: &'static str,
    pub lat: f64,
    pub lon: f64,
    heading: f64,
}

pub struct Fleet {
    nodes: Vec<SimNode>,
    center_lat: f64,
    center_lon: f64,
    radius_deg: f64,
    rng: StdRng,
}

impl Fleet {
    pub fn new(count: usize, center_lat: f64, center_lon: f64, radius_km: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let radius_deg = radius_km.max(0.1) * DEG_PER_KM;
        let nodes = (0..count.max(1))
            .map(|i| {
                // Two-hex prefix first so the backend's node-hash map works.
                let id = format!("{:02X}{:08X}", rng.gen::<u8>(), rng.gen::<u32>());
                let angle = i as f64 / count.max(1) as f64 * std::f64::consts::TAU;
                SimNode {
                    id,
                    name: format!("{} {}", NAMES[i % NAMES.len()], i + 1),
                    role: ROLES[i % ROLES.len()],
                    lat: center_lat + angle.sin() * radius_deg,
                    lon: center_lon + angle.cos() * radius_deg,
                    heading: rng.gen_range(0.0..std::f64::consts::TAU),
                }
            })
            .collect();
        Self { nodes, center_lat, center_lon, radius_deg, rng }
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Drift every node a little; wander back toward the ring when a node
    /// strays too far out.
    pub fn advance(&mut self) {
        for node in &mut self.nodes {
            node.heading += self.rng.gen_range(-0.4..0.4);
            let step = self.radius_deg * 0.02;
            node.lat += node.heading.sin() * step;
            node.lon += node.heading.cos() * step;

            let d_lat = node.lat - self.center_lat;
            let d_lon = node.lon - self.center_lon;
            if (d_lat * d_lat + d_lon * d_lon).sqrt() > self.radius_deg * 1.5 {
                node.heading = d_lon.atan2(d_lat) + std::f64::consts::PI;
            }
        }
    }

    /// A random receiver plus a synthetic multi-hop packet blob. The blob
    /// starts with a path header (hop count, then the node hash of each of
    /// 1-3 intermediate fleet nodes) followed by a random payload tail, so
    /// a decoder that reads the header resolves real fleet hops.
    pub fn random_packet(&mut self) -> Option<(String, Vec<u8>)> {
        if self.nodes.len() < 2 {
            return None;
        }
        let receiver_idx = self.rng.gen_range(0..self.nodes.len());
        let receiver = self.nodes[receiver_idx].id.clone();

        let mut others: Vec<usize> = (0..self.nodes.len()).filter(|&i| i != receiver_idx).collect();
        others.shuffle(&mut self.rng);
        let hop_count = self.rng.gen_range(1..=3).min(others.len());
        let hops: Vec<u8> = others[..hop_count]
            .iter()
            .filter_map(|&i| u8::from_str_radix(&self.nodes[i].id[..2], 16).ok())
            .collect();

        let mut blob = Vec::with_capacity(2 + hops.len() + 32);
        blob.push(hops.len() as u8);
        blob.extend_from_slice(&hops);
        let tail_len = self.rng.gen_range(16..40);
        blob.extend((0..tail_len).map(|_| self.rng.gen::<u8>()));
        Some((receiver, blob))
    }
}
