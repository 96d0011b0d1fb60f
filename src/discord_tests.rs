//! Unit tests for the discord module

#[cfg(test)]
mod tests {
    use crate::discord::VoiceReceiver;
    use crate::pipeline::CapturedFrame;
    use tokio::sync::mpsc;

    fn frame(speaker: u64) -> CapturedFrame {
        CapturedFrame::from_i16(speaker, &[0i16; 4], 2)
    }

    #[test]
    fn test_receiver_forwards_frames() {
        let (tx, mut rx) = mpsc::channel(4);
        let receiver = VoiceReceiver { tx };

        assert!(receiver.deliver(frame(7)));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.speaker, 7);
        assert_eq!(received.channels, 2);
    }

    #[test]
    fn test_receiver_drops_frames_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let receiver = VoiceReceiver { tx };

        assert!(receiver.deliver(frame(1)));
        assert!(receiver.deliver(frame(2)));

        assert_eq!(rx.try_recv().unwrap().speaker, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_receiver_retires_after_session_ends() {
        let (tx, rx) = mpsc::channel(4);
        let receiver = VoiceReceiver { tx };

        drop(rx);

        assert!(!receiver.deliver(frame(1)));
    }
}
