use crate::frame_info::GameInput;
use crate::{Frame, PlayerHandle, NULL_FRAME};
use std::cmp;
use tracing::trace;

/// The length of the input queue. This describes the number of inputs rollnet can hold at the same time per player.
pub(crate) const INPUT_QUEUE_LENGTH: usize = 128;

fn previous_position(position: usize) -> usize {
    match position {
        0 => INPUT_QUEUE_LENGTH - 1,
        _ => position - 1,
    }
}

/// `InputQueue` handles inputs for a single player and saves them in a circular array. Valid inputs are between `tail` and `head`.
/// Frames submitted by the application are strictly monotonic; frames stored in the queue are offset by the frame delay and contiguous.
#[derive(Debug, Clone)]
pub(crate) struct InputQueue {
    /// Identifies the player this `InputQueue` belongs to.
    id: PlayerHandle,
    /// The head of the queue. The newest `GameInput` is saved right before here.
    head: usize,
    /// The tail of the queue. The oldest `GameInput` still valid is saved here.
    tail: usize,
    /// The current length of the queue.
    length: usize,
    /// Denotes if we are still in the first frame, an edge case to be considered by some methods.
    first_frame: bool,

    /// The highest frame the application submitted via `add_input`.
    last_user_added_frame: Frame,
    /// The highest frame actually stored. Differs from `last_user_added_frame` by the frame delay.
    last_added_frame: Frame,
    /// The first frame in the queue that is known to be an incorrect prediction.
    first_incorrect_frame: Frame,
    /// The last frame that has been requested. We make sure to never delete anything at or before this, as it may still be needed.
    last_frame_requested: Frame,

    /// The delay in frames between the submission of an input and its execution.
    frame_delay: u32,

    /// Our cyclic input queue.
    inputs: [GameInput; INPUT_QUEUE_LENGTH],
    /// A pre-allocated prediction we are going to use to return predictions from. Its frame is null while not predicting.
    prediction: GameInput,
}

impl InputQueue {
    pub(crate) fn new(id: PlayerHandle, input_size: usize) -> Self {
        Self {
            id,
            head: 0,
            tail: 0,
            length: 0,
            frame_delay: 0,
            first_frame: true,
            last_user_added_frame: NULL_FRAME,
            last_added_frame: NULL_FRAME,
            first_incorrect_frame: NULL_FRAME,
            last_frame_requested: NULL_FRAME,

            prediction: GameInput::new(NULL_FRAME, input_size),
            inputs: [GameInput::new(NULL_FRAME, input_size); INPUT_QUEUE_LENGTH],
        }
    }

    pub(crate) const fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// The highest frame that has been stored. Remote peers acknowledge stored frames, so
    /// confirmation tracks storage, not submission.
    pub(crate) const fn last_confirmed_frame(&self) -> Frame {
        self.last_added_frame
    }

    #[allow(dead_code)]
    pub(crate) const fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn set_frame_delay(&mut self, delay: u32) {
        self.frame_delay = delay;
    }

    pub(crate) fn reset_prediction(&mut self, frame: Frame) {
        assert!(self.first_incorrect_frame == NULL_FRAME || frame <= self.first_incorrect_frame);
        trace!(player = self.id, frame, "resetting prediction state");

        self.prediction.frame = NULL_FRAME;
        self.first_incorrect_frame = NULL_FRAME;
        self.last_frame_requested = NULL_FRAME;
    }

    /// Returns a `GameInput`, but only if the input for the requested frame is confirmed.
    /// In contrast to `input()`, this will never return a prediction, but panic instead.
    pub(crate) fn confirmed_input(&self, requested_frame: Frame) -> GameInput {
        assert!(requested_frame >= 0);
        let offset = requested_frame as usize % INPUT_QUEUE_LENGTH;

        if self.inputs[offset].frame == requested_frame {
            return self.inputs[offset];
        }

        // a confirmed input should never be requested for a frame the queue does not hold
        panic!("InputQueue::confirmed_input(): there is no confirmed input for the requested frame");
    }

    /// Discards inputs with a stored frame at or before `frame`. All confirmed frames are guaranteed to be synchronized
    /// between players, so there is no need to keep them. Inputs at or after the last requested frame are always kept.
    pub(crate) fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        assert!(frame >= 0);

        // never drop back past the last requested frame, the data may still be served
        if self.last_frame_requested != NULL_FRAME {
            frame = cmp::min(frame, self.last_frame_requested);
        }

        trace!(
            player = self.id,
            frame,
            last_added = self.last_added_frame,
            length = self.length,
            "discarding confirmed frames"
        );

        if frame >= self.last_added_frame {
            // everything stored is confirmed and old, empty the queue
            self.tail = self.head;
            self.length = 0;
        } else if frame < self.inputs[self.tail].frame {
            // nothing stored that far back, keep everything
        } else {
            // move the tail forward past `frame`, wrapping around if necessary
            let offset = (frame - self.inputs[self.tail].frame + 1) as usize;
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the game input for the given frame. If that input is not confirmed yet, we return a prediction instead.
    pub(crate) fn input(&mut self, requested_frame: Frame) -> GameInput {
        // once a prediction error is known, serving further inputs would just walk further down the wrong path
        assert!(self.first_incorrect_frame == NULL_FRAME);

        // remember the last requested frame number, `add_input` needs it to drop out of prediction mode
        self.last_frame_requested = requested_frame;

        // the frame must not be older than the oldest frame still held
        assert!(requested_frame >= self.inputs[self.tail].frame);

        if self.prediction.frame == NULL_FRAME {
            // if the requested frame is in our range, fetch it out of the queue and return it
            let mut offset = (requested_frame - self.inputs[self.tail].frame) as usize;

            if offset < self.length {
                offset = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                assert!(self.inputs[offset].frame == requested_frame);
                return self.inputs[offset]; // GameInput has copy semantics
            }

            // the requested frame is not confirmed yet, so we start predicting that
            // the player will keep doing whatever they did most recently
            if requested_frame == 0 || self.last_added_frame == NULL_FRAME {
                // basing the prediction on nothing, since we are at frame 0 or have no inputs yet
                self.prediction.erase_bits();
            } else {
                // basing the prediction on the most recently stored input
                self.prediction = self.inputs[previous_position(self.head)];
            }
            self.prediction.frame += 1;
        }

        // we are predicting, return the prediction bits stamped with the requested frame
        assert!(self.prediction.frame != NULL_FRAME);
        let mut prediction_to_return = self.prediction; // GameInput has copy semantics
        prediction_to_return.frame = requested_frame;
        prediction_to_return
    }

    /// Adds an application-submitted input to the queue, considering the set frame delay.
    /// Returns the frame the input was actually stored at, or [`NULL_FRAME`] if the input was
    /// dropped because a decreased frame delay made it obsolete.
    pub(crate) fn add_input(&mut self, input: GameInput) -> Frame {
        trace!(player = self.id, frame = input.frame, "adding input to queue");

        // inputs must be submitted sequentially, regardless of frame delay
        assert!(
            self.last_user_added_frame == NULL_FRAME
                || input.frame == self.last_user_added_frame + 1
        );
        self.last_user_added_frame = input.frame;

        // move the queue head to the correct point in preparation to add the input to the queue
        let new_frame = self.advance_queue_head(input.frame);
        if new_frame != NULL_FRAME {
            self.add_delayed_input(input, new_frame);
        }
        new_frame
    }

    /// Adds an input to the queue at the given stored frame number. If there are pending predictions
    /// for that frame, compares them and records the first mismatch.
    fn add_delayed_input(&mut self, input: GameInput, frame_number: Frame) {
        assert!(input.size == self.prediction.size);
        assert!(self.last_added_frame == NULL_FRAME || frame_number == self.last_added_frame + 1);
        assert!(
            frame_number == 0
                || self.inputs[previous_position(self.head)].frame == frame_number - 1
        );

        // add the input to the back of the queue
        self.inputs[self.head] = input;
        self.inputs[self.head].frame = frame_number;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;
        assert!(self.length <= INPUT_QUEUE_LENGTH);
        self.first_frame = false;
        self.last_added_frame = frame_number;

        if self.prediction.frame != NULL_FRAME {
            // we have been predicting this frame, check if the bits we served were correct
            assert!(frame_number == self.prediction.frame);

            // remember the first incorrect frame so the session can roll back to it
            if self.first_incorrect_frame == NULL_FRAME && !self.prediction.equal(&input, true) {
                trace!(
                    player = self.id,
                    frame = frame_number,
                    "input does not match prediction, marking error"
                );
                self.first_incorrect_frame = frame_number;
            }

            // if this confirmation catches up to the last frame the application requested without any
            // mismatch, we can leave prediction mode. Otherwise the prediction moves on to the next frame.
            if self.prediction.frame == self.last_frame_requested
                && self.first_incorrect_frame == NULL_FRAME
            {
                self.prediction.frame = NULL_FRAME;
            } else {
                self.prediction.frame += 1;
            }
        }
    }

    /// Advances the queue head to the frame the input should be stored at. Fills the gap with copies of the previous
    /// input if the frame delay was increased, drops the input if the delay was decreased.
    fn advance_queue_head(&mut self, input_frame: Frame) -> Frame {
        let mut expected_frame = if self.first_frame {
            0
        } else {
            self.inputs[previous_position(self.head)].frame + 1
        };

        let input_frame = input_frame + self.frame_delay as i32;
        if expected_frame > input_frame {
            // the frame delay dropped since the last input, there is no room for this frame
            trace!(
                player = self.id,
                frame = input_frame,
                expected_frame,
                "dropping input, frame delay decreased"
            );
            return NULL_FRAME;
        }

        // the frame delay was increased since the last input, replicate the last input
        // to fill the gap so stored frames stay contiguous
        while expected_frame < input_frame {
            let input_to_replicate = self.inputs[previous_position(self.head)];
            self.add_delayed_input(input_to_replicate, expected_frame);
            expected_frame += 1;
        }

        assert!(
            input_frame == 0
                || input_frame == self.inputs[previous_position(self.head)].frame + 1
        );
        input_frame
    }
}

// #########
// # TESTS #
// #########
