/*
    A bank account replicated over a group communication service. Every
    replica buffers the transactions issued locally, multicasts them in
    batches with the safe (totally ordered) guarantee, and applies whatever
    the group delivers in delivery order. Because interest and deposits do not
    commute, the shared delivery order is what keeps the balances equal.
    Nothing is sent until a minimum number of replicas has been seen, and
    replicas joining later receive the current balance instead of the history.
*/

pub mod common;
pub mod console;
pub mod network;
pub mod replica;
