//! Emulated global memory.
//!
//! Kernel bodies run on fiber threads and blocks run on several workers, so
//! every element is stored in a relaxed atomic word. Reads and writes are
//! sound from any thread; ordering between blocks is whatever the kernel
//! establishes itself, as on hardware.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

mod sealed {
    pub trait Sealed {}
}

/// Element types storable in a [`DeviceBuffer`].
pub trait Element: Copy + Default + Send + Sync + 'static + sealed::Sealed {
    #[doc(hidden)]
    type Word: Send + Sync;
    #[doc(hidden)]
    fn word(value: Self) -> Self::Word;
    #[doc(hidden)]
    fn load(word: &Self::Word) -> Self;
    #[doc(hidden)]
    fn store(word: &Self::Word, value: Self);
}

macro_rules! impl_element {
    ($atomic:ty, $bits:ty: $($ty:ty),+) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                type Word = $atomic;

                fn word(value: Self) -> Self::Word {
                    <$atomic>::new(bytemuck::cast::<$ty, $bits>(value))
                }

                fn load(word: &Self::Word) -> Self {
                    bytemuck::cast::<$bits, $ty>(word.load(Ordering::Relaxed))
                }

                fn store(word: &Self::Word, value: Self) {
                    word.store(bytemuck::cast::<$ty, $bits>(value), Ordering::Relaxed)
                }
            }
        )+
    };
}

impl_element!(AtomicU32, u32: i32, u32, f32);
impl_element!(AtomicU64, u64: i64, u64, f64);

/// Fixed-size array in emulated global memory.
pub struct DeviceBuffer<T: Element> {
    words: Box<[T::Word]>,
}

impl<T: Element> DeviceBuffer<T> {
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: (0..len).map(|_| T::word(T::default())).collect(),
        }
    }

    pub fn from_slice(values: &[T]) -> Self {
        Self {
            words: values.iter().map(|&v| T::word(v)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Panics if `index` is out of bounds.
    pub fn get(&self, index: usize) -> T {
        T::load(&self.words[index])
    }

    /// Panics if `index` is out of bounds.
    pub fn set(&self, index: usize, value: T) {
        T::store(&self.words[index], value)
    }

    pub fn fill(&self, value: T) {
        for word in self.words.iter() {
            T::store(word, value);
        }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.words.iter().map(T::load).collect()
    }

    /// Non-atomic read-modify-write returning the previous value.
    pub(crate) fn update(&self, index: usize, f: impl FnOnce(T) -> T) -> T {
        let word = &self.words[index];
        let old = T::load(word);
        T::store(word, f(old));
        old
    }
}

impl<T: Element> From<Vec<T>> for DeviceBuffer<T> {
    fn from(values: Vec<T>) -> Self {
        Self::from_slice(&values)
    }
}

impl<T: Element + fmt::Debug> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_vec()).finish()
    }
}
