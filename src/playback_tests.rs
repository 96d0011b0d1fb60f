//! Unit tests for the playback module

#[cfg(test)]
mod tests {
    use crate::pipeline::PlaybackSink;
    use crate::playback::{create_buffer, BufferedSink, PlaybackBuffer};

    #[test]
    fn test_empty_buffer_pulls_silence() {
        let mut buffer = PlaybackBuffer::new();

        assert!(!buffer.has_data());
        assert_eq!(buffer.pull_samples(4), vec![0.0; 4]);
        assert_eq!(buffer.total_samples_played(), 0);
    }

    #[test]
    fn test_push_and_pull() {
        let mut buffer = PlaybackBuffer::new();
        buffer.push_samples(&[0.1, 0.2, 0.3]);

        assert!(buffer.has_data());
        assert_eq!(buffer.buffer_level(), 3);
        assert_eq!(buffer.pull_samples(2), vec![0.1, 0.2]);
        assert_eq!(buffer.buffer_level(), 1);

        // Short read is padded with silence
        assert_eq!(buffer.pull_samples(3), vec![0.3, 0.0, 0.0]);
        assert!(!buffer.has_data());
        assert_eq!(buffer.total_samples_played(), 3);
    }

    #[test]
    fn test_overlapping_pushes_are_appended() {
        let mut buffer = PlaybackBuffer::new();
        buffer.push_samples(&[0.1, 0.1]);
        buffer.push_samples(&[0.2, 0.2]);

        assert_eq!(buffer.pull_samples(4), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_bound_drops_oldest() {
        let mut buffer = PlaybackBuffer::with_max_buffered(4);
        buffer.push_samples(&[0.1, 0.2, 0.3]);
        buffer.push_samples(&[0.4, 0.5, 0.6]);

        assert_eq!(buffer.buffer_level(), 4);
        assert_eq!(buffer.total_samples_dropped(), 2);
        assert_eq!(buffer.pull_samples(4), vec![0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn test_compaction_keeps_unread_audio() {
        let mut buffer = PlaybackBuffer::new();
        let samples: Vec<f32> = (0..50_000).map(|i| i as f32).collect();
        buffer.push_samples(&samples);

        let first = buffer.pull_samples(48_000);
        assert_eq!(first[47_999], 47_999.0);

        assert_eq!(buffer.buffer_level(), 2_000);
        assert_eq!(buffer.pull_samples(2), vec![48_000.0, 48_001.0]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = PlaybackBuffer::new();
        buffer.push_samples(&[0.5; 10]);
        buffer.pull_samples(5);

        buffer.clear();

        assert!(!buffer.has_data());
        assert_eq!(buffer.total_samples_played(), 0);
        assert_eq!(buffer.pull_samples(1), vec![0.0]);
    }

    #[tokio::test]
    async fn test_buffered_sink_queues_audio() {
        let shared = create_buffer();
        let sink = BufferedSink::new(shared.clone());

        sink.play(vec![0.25; 8]).await.unwrap();
        sink.play(vec![0.5; 8]).await.unwrap();

        let mut buffer = shared.lock().unwrap();
        assert_eq!(buffer.buffer_level(), 16);
        assert_eq!(buffer.pull_samples(9)[8], 0.5);
    }
}
