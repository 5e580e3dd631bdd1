extern crate fs2;

pub mod dir_lock;

pub trait FlipSign<T> {
	/// Transmutes an signed/unsigned integer into it's opposite unsigned/signed integer while maintaining bitwise equivalence even though the integer value may change
	/// 
	/// We use this rather than directly relying on 'as' inline to specify times when we intentionally don't care about the value over/underflowing upon reinterpretation of the bits in a different sign
	fn flip(self) -> T;
}

impl FlipSign<u16> for i16 { fn flip(self) -> u16 { self as u16 } }
impl FlipSign<i16> for u16 { fn flip(self) -> i16 { self as i16 } }
impl FlipSign<u32> for i32 { fn flip(self) -> u32 { self as u32 } }
impl FlipSign<i32> for u32 { fn flip(self) -> i32 { self as i32 } }
impl FlipSign<u64> for i64 { fn flip(self) -> u64 { self as u64 } }
impl FlipSign<i64> for u64 { fn flip(self) -> i64 { self as i64 } }

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flip_round_trips_no_vote_sentinel() {
		let no_vote: i64 = -1;
		let raw: u64 = no_vote.flip();
		let back: i64 = raw.flip();
		assert_eq!(back, no_vote);
	}
}

