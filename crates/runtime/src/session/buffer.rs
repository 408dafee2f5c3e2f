use std::collections::VecDeque;

use bytes::Bytes;

/// Terminal output received while no sink is attached.
///
/// Bounded FIFO: when full, the oldest bytes are discarded so the newest
/// `capacity` bytes always survive.
#[derive(Debug)]
pub struct PreAttachBuffer {
	chunks: VecDeque<Bytes>,
	len: usize,
	capacity: usize,
	discarded: u64,
}

impl PreAttachBuffer {
	pub fn new(capacity: usize) -> Self {
		Self {
			chunks: VecDeque::new(),
			len: 0,
			capacity,
			discarded: 0,
		}
	}

	pub fn push(&mut self, mut chunk: Bytes) {
		if chunk.is_empty() {
			return;
		}
		if chunk.len() >= self.capacity {
			let skip = chunk.len() - self.capacity;
			self.discarded += (self.len + skip) as u64;
			self.chunks.clear();
			self.len = 0;
			chunk = chunk.slice(skip..);
		}

		self.len += chunk.len();
		self.chunks.push_back(chunk);

		while self.len > self.capacity {
			let excess = self.len - self.capacity;
			let Some(front) = self.chunks.front_mut() else {
				break;
			};
			if front.len() <= excess {
				self.len -= front.len();
				self.discarded += front.len() as u64;
				self.chunks.pop_front();
			} else {
				*front = front.slice(excess..);
				self.len -= excess;
				self.discarded += excess as u64;
			}
		}
	}

	/// Takes everything buffered, oldest first.
	pub fn drain(&mut self) -> Vec<Bytes> {
		self.len = 0;
		self.chunks.drain(..).collect()
	}

	pub fn clear(&mut self) {
		self.chunks.clear();
		self.len = 0;
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Bytes thrown away to stay under capacity.
	pub fn discarded(&self) -> u64 {
		self.discarded
	}
}
