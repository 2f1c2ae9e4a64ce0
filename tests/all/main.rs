mod exchanges;
mod helpers;
mod queues;
