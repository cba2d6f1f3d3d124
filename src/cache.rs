use std::{
    num::NonZeroUsize,
    sync::{Mutex, PoisonError},
};

use lru::LruCache;

use crate::{
    directory::ModelId, dispatcher::QueryDispatcher, encoder::EncodedImage, error::Result,
};

/// Identifies a question independently of the order its images were given in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    question: String,
    image_hashes: Vec<[u8; 32]>,
    model: ModelId,
}

impl CacheKey {
    fn new(question: &str, images: &[EncodedImage], model: &ModelId) -> Self {
        let mut image_hashes: Vec<[u8; 32]> = images
            .iter()
            .map(|image| *blake3::hash(image.as_str().as_bytes()).as_bytes())
            .collect();
        image_hashes.sort_unstable();

        Self {
            question: question.to_string(),
            image_hashes,
            model: model.clone(),
        }
    }
}

/// Opt-in LRU cache of answers in front of another dispatcher.
///
/// The wrapped call samples from a model, so a hit replays an earlier answer
/// instead of producing a fresh one. Only successful answers are stored.
pub struct CachedDispatcher<D> {
    inner: D,
    answers: Mutex<LruCache<CacheKey, String>>,
}

impl<D: QueryDispatcher> CachedDispatcher<D> {
    pub fn new(inner: D, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            answers: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.answers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<D: QueryDispatcher> QueryDispatcher for CachedDispatcher<D> {
    fn ask(&self, question: &str, images: &[EncodedImage], model: &ModelId) -> Result<String> {
        let key = CacheKey::new(question, images, model);

        if let Some(answer) = self
            .answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            log::debug!("Answer cache hit for model {}", model);
            return Ok(answer.clone());
        }

        // the lock is not held while the inner call blocks
        let answer = self.inner.ask(question, images, model)?;

        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, answer.clone());

        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encoder::encode, error::ChatError};
    use image::ImageFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDispatcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl QueryDispatcher for CountingDispatcher {
        fn ask(&self, question: &str, images: &[EncodedImage], _: &ModelId) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ChatError::Inference("offline".to_string()));
            }
            Ok(format!("{} #{} ({} images)", question, n, images.len()))
        }
    }

    fn images() -> Vec<EncodedImage> {
        vec![
            encode(&crate::encoder::tests::sample_image(3, 3, ImageFormat::Png)).unwrap(),
            encode(&crate::encoder::tests::sample_image(5, 2, ImageFormat::Png)).unwrap(),
        ]
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn repeated_question_hits_cache() {
        let cached = CachedDispatcher::new(CountingDispatcher::default(), capacity(4));
        let model = ModelId::from("llava");

        let first = cached.ask("what is this?", &images(), &model).unwrap();
        let second = cached.ask("what is this?", &images(), &model).unwrap();

        assert_eq!(first, second);
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn image_order_does_not_change_key() {
        let cached = CachedDispatcher::new(CountingDispatcher::default(), capacity(4));
        let model = ModelId::from("llava");
        let mut reversed = images();
        reversed.reverse();

        cached.ask("q", &images(), &model).unwrap();
        cached.ask("q", &reversed, &model).unwrap();
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_input_is_part_of_the_key() {
        let cached = CachedDispatcher::new(CountingDispatcher::default(), capacity(8));
        let llava = ModelId::from("llava");

        cached.ask("q", &images(), &llava).unwrap();
        cached.ask("other", &images(), &llava).unwrap();
        cached.ask("q", &images()[..1], &llava).unwrap();
        cached.ask("q", &images(), &ModelId::from("minicpm-v")).unwrap();

        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failures_are_not_cached() {
        let inner = CountingDispatcher {
            fail: true,
            ..Default::default()
        };
        let cached = CachedDispatcher::new(inner, capacity(4));
        let model = ModelId::from("llava");

        assert!(cached.ask("q", &images(), &model).is_err());
        assert!(cached.ask("q", &images(), &model).is_err());
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 2);
        assert!(cached.is_empty());
    }

    #[test]
    fn least_recently_used_answer_is_evicted() {
        let cached = CachedDispatcher::new(CountingDispatcher::default(), capacity(1));
        let model = ModelId::from("llava");

        cached.ask("a", &[], &model).unwrap();
        cached.ask("b", &[], &model).unwrap();
        cached.ask("a", &[], &model).unwrap();
        assert_eq!(cached.inner().calls.load(Ordering::SeqCst), 3);

        cached.clear();
        assert!(cached.is_empty());
    }
}
