//! Compressed Sparse Row (CSR) donor graph for drainage topology.
//!
//! Built from a receiver array where `receivers[i] == i` marks a sink. Row
//! `i` lists the donors of cell `i`, i.e. every cell whose single downstream
//! pointer refers to `i`.

/// CSR representation of the upstream adjacency of a drainage network.
#[derive(Debug, Clone)]
pub struct DonorGraph {
    offsets: Vec<usize>,
    donors: Vec<usize>,
}

impl DonorGraph {
    pub fn from_receivers(receivers: &[usize]) -> Self {
        let n = receivers.len();
        let mut counts = vec![0usize; n];
        for (donor, &recv) in receivers.iter().enumerate() {
            if recv < n && recv != donor {
                counts[recv] += 1;
            }
        }
        let mut offsets = Vec::with_capacity(n + 1);
        let mut running = 0usize;
        offsets.push(0);
        for &c in &counts {
            running += c;
            offsets.push(running);
        }
        let mut donors = vec![0usize; running];
        let mut write_pos = offsets[..n].to_vec();
        for (donor, &recv) in receivers.iter().enumerate() {
            if recv < n && recv != donor {
                donors[write_pos[recv]] = donor;
                write_pos[recv] += 1;
            }
        }
        Self { offsets, donors }
    }

    #[inline]
    pub fn donors_of(&self, node: usize) -> &[usize] {
        &self.donors[self.offsets[node]..self.offsets[node + 1]]
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.offsets.len() - 1
    }

    #[inline]
    pub fn num_edges(&self) -> usize {
        self.donors.len()
    }

    #[inline]
    pub fn degree(&self, node: usize) -> usize {
        self.offsets[node + 1] - self.offsets[node]
    }
}
